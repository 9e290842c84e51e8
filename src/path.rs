//! Attribute path grammar: `endpoint "/" cluster "/" attribute`.
//!
//! Each component is a decimal integer or the literal `*` wildcard. Wildcards
//! are accepted for reads; writes require a concrete endpoint.

use std::fmt;
use std::str::FromStr;

use crate::error::ControllerError;

/// Parsed attribute path with optional wildcard components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributePath {
    pub endpoint_id: Option<u16>,
    pub cluster_id: Option<u32>,
    pub attribute_id: Option<u32>,
}

impl AttributePath {
    /// The full-wildcard path used for interviews and subscriptions.
    pub const WILDCARD: AttributePath = AttributePath {
        endpoint_id: None,
        cluster_id: None,
        attribute_id: None,
    };

    pub fn new(endpoint_id: u16, cluster_id: u32, attribute_id: u32) -> Self {
        Self {
            endpoint_id: Some(endpoint_id),
            cluster_id: Some(cluster_id),
            attribute_id: Some(attribute_id),
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.endpoint_id.is_some() && self.cluster_id.is_some() && self.attribute_id.is_some()
    }
}

impl FromStr for AttributePath {
    type Err = ControllerError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || ControllerError::InvalidArguments(format!("Invalid attribute path: {input}"));
        let mut parts = input.split('/');
        let (Some(endpoint), Some(cluster), Some(attribute), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        Ok(AttributePath {
            endpoint_id: parse_component(endpoint).ok_or_else(invalid)?,
            cluster_id: parse_component(cluster).ok_or_else(invalid)?,
            attribute_id: parse_component(attribute).ok_or_else(invalid)?,
        })
    }
}

fn parse_component<T: FromStr>(part: &str) -> Option<Option<T>> {
    if part == "*" {
        return Some(None);
    }
    part.parse::<T>().ok().map(Some)
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn component<T: fmt::Display>(value: Option<T>) -> String {
            value.map_or_else(|| "*".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "{}/{}/{}",
            component(self.endpoint_id),
            component(self.cluster_id),
            component(self.attribute_id)
        )
    }
}

/// Canonical textual form of a concrete attribute path.
pub fn format_attribute_path(endpoint_id: u16, cluster_id: u32, attribute_id: u32) -> String {
    format!("{endpoint_id}/{cluster_id}/{attribute_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_concrete() {
        let path: AttributePath = "1/6/0".parse().expect("parse");
        assert_eq!(path, AttributePath::new(1, 6, 0));
        assert!(path.is_concrete());
        assert_eq!(path.to_string(), "1/6/0");
    }

    #[test]
    fn test_parse_wildcards() {
        let path: AttributePath = "0/53/*".parse().expect("parse");
        assert_eq!(path.endpoint_id, Some(0));
        assert_eq!(path.cluster_id, Some(53));
        assert_eq!(path.attribute_id, None);

        let path: AttributePath = "*/*/*".parse().expect("parse");
        assert_eq!(path, AttributePath::WILDCARD);
        assert_eq!(path.to_string(), "*/*/*");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("1/6".parse::<AttributePath>().is_err());
        assert!("1/6/0/2".parse::<AttributePath>().is_err());
        assert!("one/6/0".parse::<AttributePath>().is_err());
        assert!("".parse::<AttributePath>().is_err());
    }

    #[test]
    fn test_format_attribute_path() {
        assert_eq!(format_attribute_path(0, 40, 9), "0/40/9");
    }
}
