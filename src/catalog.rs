//! Minimal cluster catalog for the well-known clusters the controller
//! interprets itself: attribute paths it watches, typed descriptors for
//! writes, and the vendor clusters that need polling.

use std::collections::BTreeSet;

use serde_json::Value as JsonValue;
use strum::FromRepr;

use crate::error::ControllerError;
use crate::model::NodeRecord;
use crate::value::{AttributeValue, decode_hex};

pub const CLUSTER_ID_IDENTIFY: u32 = 0x0003;
pub const CLUSTER_ID_ON_OFF: u32 = 0x0006;
pub const CLUSTER_ID_LEVEL_CONTROL: u32 = 0x0008;
pub const CLUSTER_ID_DESCRIPTOR: u32 = 0x001D;
pub const CLUSTER_ID_BASIC_INFORMATION: u32 = 0x0028;
pub const CLUSTER_ID_THREAD_NETWORK_DIAGNOSTICS: u32 = 0x0035;
pub const CLUSTER_ID_OPERATIONAL_CREDENTIALS: u32 = 0x003E;
pub const CLUSTER_ID_COLOR_CONTROL: u32 = 0x0300;

/// Device type id advertised by bridge (aggregator) endpoints.
pub const DEVICE_TYPE_BRIDGE: u64 = 14;

/// Attribute paths the controller consults on its own cached data.
pub const ROUTING_ROLE_ATTRIBUTE_PATH: &str = "0/53/1";
pub const DESCRIPTOR_PARTS_LIST_ATTRIBUTE_PATH: &str = "0/29/3";
pub const SOFTWARE_VERSION_ATTRIBUTE_PATH: &str = "0/40/9";
pub const CURRENT_FABRIC_INDEX_ATTRIBUTE_PATH: &str = "0/62/5";
pub const PRODUCT_LABEL_ATTRIBUTE_PATH: &str = "0/40/14";
pub const PRODUCT_NAME_ATTRIBUTE_PATH: &str = "0/40/3";
/// Device-type list of endpoint 1, used for bridge detection.
pub const BRIDGE_DEVICE_TYPE_LIST_PATH: &str = "1/29/0";

/// Thread routing role, as reported by ThreadNetworkDiagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum RoutingRole {
    Unspecified = 0,
    Unassigned = 1,
    SleepyEndDevice = 2,
    EndDevice = 3,
    Reed = 4,
    Router = 5,
    Leader = 6,
}

impl RoutingRole {
    /// Interpret a cached RoutingRole attribute value.
    pub fn from_attribute(value: Option<&AttributeValue>) -> Option<RoutingRole> {
        value
            .and_then(AttributeValue::as_u64)
            .and_then(|raw| u8::try_from(raw).ok())
            .and_then(RoutingRole::from_repr)
    }
}

/// Declared type of a writable attribute, used to coerce API-supplied values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    Bool,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    String,
    Bytes,
    List,
}

/// Look up the declared type of a well-known writable attribute.
pub fn attribute_type(cluster_id: u32, attribute_id: u32) -> Option<AttributeType> {
    let ty = match (cluster_id, attribute_id) {
        (CLUSTER_ID_IDENTIFY, 0x0000) => AttributeType::UInt16,
        (CLUSTER_ID_ON_OFF, 0x0000) => AttributeType::Bool,
        (CLUSTER_ID_ON_OFF, 0x4001) => AttributeType::UInt16,
        (CLUSTER_ID_ON_OFF, 0x4002) => AttributeType::UInt16,
        (CLUSTER_ID_ON_OFF, 0x4003) => AttributeType::UInt8,
        (CLUSTER_ID_LEVEL_CONTROL, 0x0000) => AttributeType::UInt8,
        (CLUSTER_ID_LEVEL_CONTROL, 0x0011) => AttributeType::UInt8,
        (CLUSTER_ID_DESCRIPTOR, 0x0000..=0x0003) => AttributeType::List,
        (CLUSTER_ID_BASIC_INFORMATION, 0x0005) => AttributeType::String,
        (CLUSTER_ID_BASIC_INFORMATION, 0x0009) => AttributeType::UInt32,
        (CLUSTER_ID_THREAD_NETWORK_DIAGNOSTICS, 0x0001) => AttributeType::UInt8,
        (CLUSTER_ID_OPERATIONAL_CREDENTIALS, 0x0005) => AttributeType::UInt8,
        (CLUSTER_ID_COLOR_CONTROL, 0x0000) => AttributeType::UInt8,
        (CLUSTER_ID_COLOR_CONTROL, 0x0001) => AttributeType::UInt8,
        (CLUSTER_ID_COLOR_CONTROL, 0x0007) => AttributeType::UInt16,
        _ => return None,
    };
    Some(ty)
}

/// Coerce an API-supplied JSON value into the attribute's declared type.
pub fn parse_value(
    path: &str,
    value: &JsonValue,
    ty: AttributeType,
) -> Result<AttributeValue, ControllerError> {
    let mismatch = || {
        ControllerError::InvalidArguments(format!(
            "Value {value} is not valid for attribute {path} ({ty:?})"
        ))
    };
    match ty {
        AttributeType::Bool => match value {
            JsonValue::Bool(v) => Ok(AttributeValue::Bool(*v)),
            JsonValue::Number(n) if n.as_u64() == Some(0) => Ok(AttributeValue::Bool(false)),
            JsonValue::Number(n) if n.as_u64() == Some(1) => Ok(AttributeValue::Bool(true)),
            _ => Err(mismatch()),
        },
        AttributeType::UInt8 => parse_unsigned(value, u8::MAX as u64).ok_or_else(mismatch),
        AttributeType::UInt16 => parse_unsigned(value, u16::MAX as u64).ok_or_else(mismatch),
        AttributeType::UInt32 => parse_unsigned(value, u32::MAX as u64).ok_or_else(mismatch),
        AttributeType::UInt64 => parse_unsigned(value, u64::MAX).ok_or_else(mismatch),
        AttributeType::Int8 => {
            parse_signed(value, i8::MIN as i64, i8::MAX as i64).ok_or_else(mismatch)
        }
        AttributeType::Int16 => {
            parse_signed(value, i16::MIN as i64, i16::MAX as i64).ok_or_else(mismatch)
        }
        AttributeType::Int32 => {
            parse_signed(value, i32::MIN as i64, i32::MAX as i64).ok_or_else(mismatch)
        }
        AttributeType::Int64 => parse_signed(value, i64::MIN, i64::MAX).ok_or_else(mismatch),
        AttributeType::Float => value
            .as_f64()
            .map(AttributeValue::Float)
            .ok_or_else(mismatch),
        AttributeType::String => match value {
            JsonValue::String(v) => Ok(AttributeValue::Str(v.clone())),
            JsonValue::Number(n) => Ok(AttributeValue::Str(n.to_string())),
            _ => Err(mismatch()),
        },
        AttributeType::Bytes => match value {
            JsonValue::String(hex) => decode_hex(hex)
                .map(AttributeValue::Bytes)
                .ok_or_else(mismatch),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|byte| u8::try_from(byte).ok())
                        .ok_or_else(mismatch)
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(AttributeValue::Bytes),
            _ => Err(mismatch()),
        },
        AttributeType::List => match value {
            JsonValue::Array(_) => Ok(AttributeValue::from_json(value.clone())),
            _ => Err(mismatch()),
        },
    }
}

fn parse_unsigned(value: &JsonValue, max: u64) -> Option<AttributeValue> {
    let raw = match value {
        JsonValue::Number(n) => n.as_u64()?,
        JsonValue::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    (raw <= max).then_some(AttributeValue::UInt(raw))
}

fn parse_signed(value: &JsonValue, min: i64, max: i64) -> Option<AttributeValue> {
    let raw = match value {
        JsonValue::Number(n) => n.as_i64()?,
        JsonValue::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (min..=max).contains(&raw).then_some(AttributeValue::Int(raw))
}

/// True if a Descriptor DeviceTypeList value contains the given device type.
///
/// Entries decode either as `[device_type, revision]` pairs or as structs with
/// the device type in field "0".
pub fn device_type_list_contains(value: &AttributeValue, device_type: u64) -> bool {
    let Some(entries) = value.as_list() else {
        return false;
    };
    entries.iter().any(|entry| match entry {
        AttributeValue::List(fields) => {
            fields.first().and_then(AttributeValue::as_u64) == Some(device_type)
        }
        AttributeValue::Map(fields) => {
            fields.get("0").and_then(AttributeValue::as_u64) == Some(device_type)
        }
        _ => false,
    })
}

/// Vendor clusters whose attributes are not reported via subscriptions and
/// must be polled (Eve, Third Reality).
const POLLED_CLUSTERS: &[u32] = &[0x130A_FC01, 0x130D_FC00];

/// Attribute paths on this node that need periodic polling.
///
/// Pure function over the record: one wildcard path per (endpoint, cluster)
/// combination belonging to a polled vendor cluster.
pub fn check_polled_attributes(node: &NodeRecord) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    for key in node.attributes.keys() {
        let mut parts = key.split('/');
        let (Some(endpoint), Some(cluster)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let Ok(cluster_id) = cluster.parse::<u32>()
            && POLLED_CLUSTERS.contains(&cluster_id)
        {
            paths.insert(format!("{endpoint}/{cluster}/*"));
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_routing_role_from_attribute() {
        assert_eq!(
            RoutingRole::from_attribute(Some(&AttributeValue::UInt(2))),
            Some(RoutingRole::SleepyEndDevice)
        );
        assert_eq!(
            RoutingRole::from_attribute(Some(&AttributeValue::UInt(5))),
            Some(RoutingRole::Router)
        );
        assert_eq!(RoutingRole::from_attribute(None), None);
        assert_eq!(
            RoutingRole::from_attribute(Some(&AttributeValue::UInt(99))),
            None
        );
    }

    #[test]
    fn test_parse_value_coercions() {
        assert_eq!(
            parse_value("1/6/0", &json!(true), AttributeType::Bool).expect("bool"),
            AttributeValue::Bool(true)
        );
        assert_eq!(
            parse_value("1/8/0", &json!("128"), AttributeType::UInt8).expect("uint"),
            AttributeValue::UInt(128)
        );
        assert_eq!(
            parse_value("0/40/5", &json!("lamp"), AttributeType::String).expect("string"),
            AttributeValue::Str("lamp".into())
        );
        assert_eq!(
            parse_value("0/0/0", &json!("0e1d"), AttributeType::Bytes).expect("bytes"),
            AttributeValue::Bytes(vec![0x0e, 0x1d])
        );
    }

    #[test]
    fn test_parse_value_range_checks() {
        assert!(parse_value("1/8/0", &json!(256), AttributeType::UInt8).is_err());
        assert!(parse_value("1/8/0", &json!(-1), AttributeType::UInt8).is_err());
        assert!(parse_value("1/6/0", &json!("yes"), AttributeType::Bool).is_err());
    }

    #[test]
    fn test_device_type_list_contains() {
        let pairs = AttributeValue::List(vec![AttributeValue::List(vec![
            AttributeValue::UInt(14),
            AttributeValue::UInt(1),
        ])]);
        assert!(device_type_list_contains(&pairs, DEVICE_TYPE_BRIDGE));
        assert!(!device_type_list_contains(&pairs, 22));

        let structs = AttributeValue::List(vec![AttributeValue::Map(BTreeMap::from([(
            "0".to_string(),
            AttributeValue::UInt(14),
        )]))]);
        assert!(device_type_list_contains(&structs, DEVICE_TYPE_BRIDGE));
    }

    #[test]
    fn test_check_polled_attributes() {
        let mut node = NodeRecord {
            node_id: 1,
            date_commissioned: Utc::now(),
            last_interview: Utc::now(),
            interview_version: 0,
            available: false,
            is_bridge: false,
            attributes: BTreeMap::new(),
            attribute_subscriptions: Vec::new(),
        };
        assert!(check_polled_attributes(&node).is_empty());

        // 319486977 == 0x130AFC01, the Eve vendor cluster
        node.attributes
            .insert("1/319486977/319422472".to_string(), AttributeValue::UInt(1));
        node.attributes
            .insert("1/6/0".to_string(), AttributeValue::Bool(true));
        let polled = check_polled_attributes(&node);
        assert_eq!(polled, BTreeSet::from(["1/319486977/*".to_string()]));
    }
}
