//! Routing of raw mDNS service-state events.
//!
//! Browsers deliver events in bursts of duplicates; a per-name debounce timer
//! coalesces them before they are dispatched to the operational or
//! commissionable handler.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::mdns::{
    MDNS_TYPE_COMMISSIONABLE_NODE, MDNS_TYPE_OPERATIONAL_NODE, ServiceEvent, ServiceStateChange,
};

use super::MatterController;

/// Per-name debounce window for bursts of duplicate notifications.
const MDNS_DEBOUNCE: Duration = Duration::from_millis(500);

/// Minimum silence before an operational record counts as a re-discovery;
/// must stay above the highest subscription ceiling.
const NODE_MDNS_BACKOFF: Duration = Duration::from_secs(610);

const MDNS_INFO_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

impl MatterController {
    pub(crate) async fn run_mdns_router(self: Arc<Self>, mut rx: mpsc::Receiver<ServiceEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.on_mdns_service_state_change(event);
                }
            }
        }
    }

    fn on_mdns_service_state_change(&self, event: ServiceEvent) {
        let timer_key = format!("mdns/{}", event.name);

        if event.state_change == ServiceStateChange::Removed {
            self.debouncer.cancel(&timer_key);
            if event.service_type == MDNS_TYPE_OPERATIONAL_NODE {
                // operational removals are already handled by the
                // subscription supervision
                return;
            }
        }

        if self.debouncer.is_scheduled(&timer_key) {
            // a timer for this name is pending, drop the duplicate
            return;
        }

        let Some(controller) = self.strong() else {
            return;
        };
        match event.service_type.as_str() {
            MDNS_TYPE_COMMISSIONABLE_NODE => {
                self.debouncer.schedule(&timer_key, MDNS_DEBOUNCE, move || async move {
                    controller.on_mdns_commissionable_node_state(event).await;
                });
            }
            MDNS_TYPE_OPERATIONAL_NODE => {
                // filter out records that are not for our fabric
                let Some(fabric_hex) = self.fabric_id_hex() else {
                    return;
                };
                if !event.name.to_lowercase().contains(fabric_hex) {
                    return;
                }
                self.debouncer.schedule(&timer_key, MDNS_DEBOUNCE, move || async move {
                    controller.on_mdns_operational_node_state(event);
                });
            }
            _ => {}
        }
    }

    fn on_mdns_operational_node_state(&self, event: ServiceEvent) {
        // instance names are [fabricid]-[nodeid]._matter._tcp.local.
        let Some(node_id) = parse_operational_node_id(&event.name) else {
            debug!("mdns: ignoring record with unexpected name: {}", event.name);
            return;
        };
        let Some(node) = self.store.get(node_id) else {
            // not a node we know, guard just in case
            return;
        };

        let last_seen = self
            .node_last_seen
            .lock()
            .insert(node_id, std::time::Instant::now());

        // only treat an Updated change as a discovery when the node is
        // unavailable, to catch it becoming operational
        if node.available && event.state_change == ServiceStateChange::Updated {
            return;
        }
        if self.nodes_in_setup.lock().contains(&node_id) {
            // prevent duplicate setup actions
            return;
        }

        if !self.stack.node_has_subscription(node_id) {
            info!("mdns: node {node_id} discovered");
        } else if last_seen.is_none_or(|seen| seen.elapsed() > NODE_MDNS_BACKOFF) {
            // node came back after being offline for a while, or restarted
            info!("mdns: node {node_id} re-discovered");
        } else {
            return;
        }

        // (re)setup the subscriptions and polling
        let Some(controller) = self.strong() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = controller.setup_node(node_id).await {
                warn!("mdns: setup for node {node_id} failed: {err}");
            }
        });
    }

    async fn on_mdns_commissionable_node_state(&self, event: ServiceEvent) {
        match event.state_change {
            ServiceStateChange::Added => {
                let info = self
                    .browser
                    .query_service_info(
                        MDNS_TYPE_COMMISSIONABLE_NODE,
                        &event.name,
                        MDNS_INFO_REQUEST_TIMEOUT,
                    )
                    .await;
                if let Some(info) = info {
                    debug!("mdns: discovered commissionable Matter node: {info:?}");
                }
            }
            ServiceStateChange::Removed => {
                debug!("mdns: commissionable Matter node disappeared: {}", event.name);
            }
            ServiceStateChange::Updated => {}
        }
    }
}

fn parse_operational_node_id(name: &str) -> Option<u64> {
    let (_fabric, rest) = name.split_once('-')?;
    let (node_hex, _) = rest.split_once('.')?;
    u64::from_str_radix(node_hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_operational_node_id() {
        assert_eq!(
            parse_operational_node_id("ABCDEF1234567890-0000000000000007._matter._tcp.local."),
            Some(7)
        );
        assert_eq!(
            parse_operational_node_id("ABCDEF1234567890-00000000000000FF._matter._tcp.local."),
            Some(255)
        );
        assert_eq!(parse_operational_node_id("no-separator"), None);
        assert_eq!(parse_operational_node_id("plainname._matter._tcp.local."), None);
    }
}
