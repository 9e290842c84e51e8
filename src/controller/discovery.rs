//! Node address resolution and reachability probing.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};

use crate::catalog::{ROUTING_ROLE_ATTRIBUTE_PATH, RoutingRole};
use crate::error::{ControllerError, Result};
use crate::mdns::MDNS_TYPE_OPERATIONAL_NODE;
use crate::model::TEST_NODE_START;

use super::MatterController;

/// Per-address ping timeout.
const NODE_PING_TIMEOUT: Duration = Duration::from_secs(10);
/// Sleepy devices may legitimately take a long while to wake up.
const NODE_PING_TIMEOUT_BATTERY_POWERED: Duration = Duration::from_secs(60);

/// How long to wait for an mDNS info answer.
const MDNS_INFO_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

impl MatterController {
    /// Currently known IP addresses of a node, resolved via mDNS and cached.
    /// `scoped` keeps any `%ifindex` suffix on link-local addresses.
    pub async fn get_node_ip_addresses(
        &self,
        node_id: u64,
        prefer_cache: bool,
        scoped: bool,
    ) -> Result<Vec<String>> {
        let cached = self
            .last_known_ip_addresses
            .lock()
            .get(&node_id)
            .cloned()
            .unwrap_or_default();
        if prefer_cache && !cached.is_empty() {
            return Ok(strip_scopes_unless(scoped, cached));
        }
        if !self.store.contains(node_id) {
            return Err(ControllerError::NodeNotExists(node_id));
        }
        let Some(fabric_id) = self.compressed_fabric_id() else {
            warn!("Controller is not initialized yet, returning cached addresses");
            return Ok(cached);
        };

        // operational instance names are [fabricid]-[nodeid], zero-padded
        let mdns_name = format!("{fabric_id:016X}-{node_id:016X}.{MDNS_TYPE_OPERATIONAL_NODE}");
        let info = self
            .browser
            .query_service_info(
                MDNS_TYPE_OPERATIONAL_NODE,
                &mdns_name,
                MDNS_INFO_REQUEST_TIMEOUT,
            )
            .await;
        let Some(info) = info else {
            info!(
                "Node {node_id} could not be discovered on the network, \
                 returning cached IP addresses"
            );
            return Ok(cached);
        };
        self.last_known_ip_addresses
            .lock()
            .insert(node_id, info.addresses.clone());
        Ok(strip_scopes_unless(scoped, info.addresses))
    }

    /// Probe all known addresses of a node in parallel. The address the SDK
    /// currently uses counts as reachable for an available node even when it
    /// did not answer the probe.
    pub async fn ping_node(&self, node_id: u64, attempts: u32) -> Result<BTreeMap<String, bool>> {
        if node_id >= TEST_NODE_START {
            return Ok(BTreeMap::from([
                ("0.0.0.0".to_string(), true),
                ("0000:1111:2222:3333:4444".to_string(), true),
            ]));
        }
        let node = self
            .store
            .get(node_id)
            .ok_or(ControllerError::NodeNotExists(node_id))?;

        let battery_powered =
            RoutingRole::from_attribute(node.attributes.get(ROUTING_ROLE_ATTRIBUTE_PATH))
                == Some(RoutingRole::SleepyEndDevice);
        let timeout = if battery_powered {
            NODE_PING_TIMEOUT_BATTERY_POWERED
        } else {
            NODE_PING_TIMEOUT
        };

        let ip_addresses = self.get_node_ip_addresses(node_id, false, true).await?;
        let probes = ip_addresses.iter().map(|ip_address| async move {
            let clean_ip = strip_scope(ip_address).to_string();
            debug!("Node {node_id}: pinging address {clean_ip}");
            let reachable = self.pinger.ping(ip_address, timeout, attempts).await;
            (clean_ip, reachable)
        });
        let mut result: BTreeMap<String, bool> = join_all(probes).await.into_iter().collect();

        // the address the sdk uses for communicating with the device is
        // authoritative: if the sdk is connected, treat it as pingable
        if let Some((active_address, _port)) = self.stack.get_address_and_port(node_id).await {
            info!("Node {node_id}: the SDK is communicating with the device using {active_address}");
            if !result.contains_key(&active_address) && node.available {
                result.insert(active_address, true);
            }
        }
        Ok(result)
    }
}

fn strip_scope(address: &str) -> &str {
    address.split('%').next().unwrap_or(address)
}

fn strip_scopes_unless(scoped: bool, addresses: Vec<String>) -> Vec<String> {
    if scoped {
        return addresses;
    }
    addresses
        .into_iter()
        .map(|address| strip_scope(&address).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_scope() {
        assert_eq!(strip_scope("fe80::1%eth0"), "fe80::1");
        assert_eq!(strip_scope("192.168.1.10"), "192.168.1.10");
    }

    #[test]
    fn test_strip_scopes_unless() {
        let addresses = vec!["fe80::1%3".to_string(), "10.0.0.9".to_string()];
        assert_eq!(
            strip_scopes_unless(true, addresses.clone()),
            vec!["fe80::1%3".to_string(), "10.0.0.9".to_string()]
        );
        assert_eq!(
            strip_scopes_unless(false, addresses),
            vec!["fe80::1".to_string(), "10.0.0.9".to_string()]
        );
    }
}
