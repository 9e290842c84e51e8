//! Decoded Matter attribute values.
//!
//! Matter TLV payloads are heterogeneous: a single wildcard read yields
//! integers, strings, octet strings, lists and nested structs. The controller
//! keeps them in a tagged variant that round-trips through JSON for
//! persistence and the command API.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

/// Marker key used to round-trip octet strings through JSON objects.
const BYTES_MARKER: &str = "__bytes__";

/// A decoded attribute value as delivered by the Matter stack.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
    /// Sentinel produced by the stack when TLV decoding failed.
    ///
    /// Filtered at the subscription boundary; never cached or persisted.
    DecodeFailure,
}

impl AttributeValue {
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, AttributeValue::DecodeFailure)
    }

    /// Unsigned view of the value, accepting non-negative signed integers.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttributeValue::UInt(v) => Some(*v),
            AttributeValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttributeValue]> {
        match self {
            AttributeValue::List(v) => Some(v),
            _ => None,
        }
    }

    /// Convert to the natural JSON representation.
    pub fn to_json(&self) -> JsonValue {
        match self {
            AttributeValue::Null | AttributeValue::DecodeFailure => JsonValue::Null,
            AttributeValue::Bool(v) => JsonValue::Bool(*v),
            AttributeValue::UInt(v) => JsonValue::from(*v),
            AttributeValue::Int(v) => JsonValue::from(*v),
            AttributeValue::Float(v) => {
                serde_json::Number::from_f64(*v).map_or(JsonValue::Null, JsonValue::Number)
            }
            AttributeValue::Str(v) => JsonValue::String(v.clone()),
            AttributeValue::Bytes(v) => {
                let mut map = serde_json::Map::with_capacity(1);
                map.insert(BYTES_MARKER.to_string(), JsonValue::String(encode_hex(v)));
                JsonValue::Object(map)
            }
            AttributeValue::List(items) => {
                JsonValue::Array(items.iter().map(AttributeValue::to_json).collect())
            }
            AttributeValue::Map(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Reconstruct from the natural JSON representation.
    pub fn from_json(value: JsonValue) -> AttributeValue {
        match value {
            JsonValue::Null => AttributeValue::Null,
            JsonValue::Bool(v) => AttributeValue::Bool(v),
            JsonValue::Number(n) => {
                if let Some(v) = n.as_u64() {
                    AttributeValue::UInt(v)
                } else if let Some(v) = n.as_i64() {
                    AttributeValue::Int(v)
                } else {
                    AttributeValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(v) => AttributeValue::Str(v),
            JsonValue::Array(items) => {
                AttributeValue::List(items.into_iter().map(AttributeValue::from_json).collect())
            }
            JsonValue::Object(map) => {
                if map.len() == 1
                    && let Some(JsonValue::String(hex)) = map.get(BYTES_MARKER)
                    && let Some(bytes) = decode_hex(hex)
                {
                    return AttributeValue::Bytes(bytes);
                }
                AttributeValue::Map(
                    map.into_iter()
                        .map(|(k, v)| (k, AttributeValue::from_json(v)))
                        .collect(),
                )
            }
        }
    }
}

impl Serialize for AttributeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        Ok(AttributeValue::from_json(value))
    }
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub(crate) fn decode_hex(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| {
            input
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
        })
        .collect()
}
