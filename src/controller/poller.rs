//! Background loops: custom-attribute polling and the fallback node scanner.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::MatterController;

/// Sweep interval for nodes that mDNS somehow missed.
const FALLBACK_NODE_SCANNER_INTERVAL: Duration = Duration::from_secs(1800);
const FALLBACK_SCANNER_TIMER_KEY: &str = "fallback_node_scanner";

const CUSTOM_ATTRIBUTES_POLLER_INTERVAL: Duration = Duration::from_secs(30);
const CUSTOM_ATTRIBUTES_POLLER_TIMER_KEY: &str = "custom_attributes_poller";
/// Pause between nodes; polling is heavy on network traffic.
const CUSTOM_ATTRIBUTES_POLLER_NODE_THROTTLE: Duration = Duration::from_secs(2);

impl MatterController {
    /// Arm (or re-arm) the fallback scanner timer.
    pub(crate) fn schedule_fallback_scanner(&self) {
        self.debouncer.cancel(FALLBACK_SCANNER_TIMER_KEY);
        let Some(controller) = self.strong() else {
            return;
        };
        self.debouncer.schedule(
            FALLBACK_SCANNER_TIMER_KEY,
            FALLBACK_NODE_SCANNER_INTERVAL,
            move || async move {
                let task = tokio::spawn(Arc::clone(&controller).fallback_node_scanner());
                *controller.fallback_scan_task.lock() = Some(task);
            },
        );
    }

    /// Ping-probe unavailable nodes that have not been seen for a full
    /// interval and promote responsive ones back to setup.
    async fn fallback_node_scanner(self: Arc<Self>) {
        for node in self.store.list(false) {
            if node.available {
                continue;
            }
            let node_id = node.node_id;
            let last_seen = self.node_last_seen.lock().get(&node_id).copied();
            if last_seen.is_some_and(|seen| seen.elapsed() < FALLBACK_NODE_SCANNER_INTERVAL) {
                continue;
            }
            match self.ping_node(node_id, 3).await {
                Ok(result) if result.values().any(|reachable| *reachable) => {
                    info!("Node {node_id} discovered using fallback ping");
                    self.touch_last_seen(node_id);
                    if let Err(err) = self.setup_node(node_id).await {
                        warn!("Fallback setup for node {node_id} failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    debug!("Fallback ping for node {node_id} failed: {err}");
                }
            }
        }

        // reschedule self to run at next interval
        self.schedule_fallback_scanner();
    }

    /// Arm (or re-arm) the custom-attribute poller timer. Does nothing while
    /// no attributes are registered for polling.
    pub(crate) fn schedule_custom_attributes_poller(&self) {
        self.debouncer.cancel(CUSTOM_ATTRIBUTES_POLLER_TIMER_KEY);
        if self.polled_attributes.lock().is_empty() {
            return;
        }
        let Some(controller) = self.strong() else {
            return;
        };
        self.debouncer.schedule(
            CUSTOM_ATTRIBUTES_POLLER_TIMER_KEY,
            CUSTOM_ATTRIBUTES_POLLER_INTERVAL,
            move || async move {
                let task = tokio::spawn(Arc::clone(&controller).custom_attributes_poller());
                *controller.poller_task.lock() = Some(task);
            },
        );
    }

    /// Read the registered attribute paths of every available node; the read
    /// path announces value changes by itself.
    async fn custom_attributes_poller(self: Arc<Self>) {
        let targets: Vec<(u64, Vec<String>)> = self
            .polled_attributes
            .lock()
            .iter()
            .map(|(node_id, paths)| (*node_id, paths.iter().cloned().collect()))
            .collect();

        for (node_id, attribute_paths) in targets {
            let available = self
                .store
                .get(node_id)
                .map(|node| node.available)
                .unwrap_or(false);
            if !available {
                continue;
            }
            if let Err(err) = self
                .read_attribute(node_id, &attribute_paths, false)
                .await
            {
                warn!(
                    "Polling custom attribute(s) {} for node {node_id} failed: {err}",
                    attribute_paths.join(",")
                );
            }
            tokio::time::sleep(CUSTOM_ATTRIBUTES_POLLER_NODE_THROTTLE).await;
        }

        // reschedule self to run at next interval
        self.schedule_custom_attributes_poller();
    }
}
