//! Core data model: node records, node events and commissioning parameters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::value::AttributeValue;

/// Bumped whenever the interview output format changes; nodes interviewed
/// with an older version are re-interviewed on setup.
pub const DATA_MODEL_SCHEMA_VERSION: u32 = 11;

/// Node ids at or above this boundary are synthetic test nodes: in-memory
/// only, never persisted, no SDK interaction.
pub const TEST_NODE_START: u64 = 900_000;

/// A commissioned (or imported) Matter node known to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: u64,
    pub date_commissioned: DateTime<Utc>,
    pub last_interview: DateTime<Utc>,
    pub interview_version: u32,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub is_bridge: bool,
    /// Decoded attribute cache keyed by `"{endpoint}/{cluster}/{attribute}"`.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Caller-defined subscription path patterns; opaque to the controller
    /// and preserved across re-interviews.
    #[serde(default)]
    pub attribute_subscriptions: Vec<String>,
}

impl NodeRecord {
    pub fn is_test_node(&self) -> bool {
        self.node_id >= TEST_NODE_START
    }

    /// Skeleton record used when strict reconstruction of stored state fails.
    ///
    /// Timestamps are salvaged when present; `interview_version` is reset to 0
    /// so the node is re-interviewed on next setup.
    pub fn fallback_from_stored(node_id: u64, stored: &JsonValue) -> NodeRecord {
        let timestamp = |field: &str| {
            stored
                .get(field)
                .and_then(JsonValue::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|parsed| parsed.with_timezone(&Utc))
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        };
        NodeRecord {
            node_id,
            date_commissioned: timestamp("date_commissioned"),
            last_interview: timestamp("last_interview"),
            interview_version: 0,
            available: false,
            is_bridge: false,
            attributes: BTreeMap::new(),
            attribute_subscriptions: Vec::new(),
        }
    }
}

/// Credentials for a commissioning window opened on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissioningParameters {
    pub setup_pin_code: u32,
    pub setup_manual_code: String,
    pub setup_qr_code: String,
}

/// An event delivered by a node subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node_id: u64,
    pub endpoint_id: u16,
    pub cluster_id: u32,
    pub event_id: u32,
    pub event_number: u64,
    pub priority: u8,
    pub timestamp: u64,
    pub timestamp_type: u8,
    pub data: Option<AttributeValue>,
}

/// A commissionable node discovered over BLE or mDNS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommissionableNodeData {
    pub instance_name: Option<String>,
    pub host_name: Option<String>,
    pub port: Option<u16>,
    pub long_discriminator: Option<u16>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub commissioning_mode: Option<u8>,
    pub device_type: Option<u32>,
    pub device_name: Option<String>,
    pub pairing_instruction: Option<String>,
    pub pairing_hint: Option<u16>,
    pub mrp_retry_interval_idle: Option<u32>,
    pub mrp_retry_interval_active: Option<u32>,
    pub supports_tcp: Option<bool>,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub rotating_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_record_roundtrip() {
        let node = NodeRecord {
            node_id: 5,
            date_commissioned: Utc::now(),
            last_interview: Utc::now(),
            interview_version: DATA_MODEL_SCHEMA_VERSION,
            available: true,
            is_bridge: false,
            attributes: BTreeMap::from([("0/40/9".to_string(), AttributeValue::UInt(10))]),
            attribute_subscriptions: vec!["1/6/*".to_string()],
        };
        let encoded = serde_json::to_value(&node).expect("serialize");
        let decoded: NodeRecord = serde_json::from_value(encoded).expect("deserialize");
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_fallback_salvages_timestamps() {
        let stored = json!({
            "node_id": 3,
            "date_commissioned": "2024-05-01T10:00:00Z",
            "attributes": "garbage",
        });
        let node = NodeRecord::fallback_from_stored(3, &stored);
        assert_eq!(node.node_id, 3);
        assert_eq!(node.interview_version, 0);
        assert_eq!(
            node.date_commissioned,
            DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").expect("ts")
        );
        assert_eq!(node.last_interview, DateTime::<Utc>::UNIX_EPOCH);
        assert!(node.attributes.is_empty());
    }

    #[test]
    fn test_test_node_boundary() {
        let mut node = NodeRecord::fallback_from_stored(TEST_NODE_START - 1, &json!({}));
        assert!(!node.is_test_node());
        node.node_id = TEST_NODE_START;
        assert!(node.is_test_node());
    }
}
