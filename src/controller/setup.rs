//! Serialized per-node bring-up: resolve, interview if needed, subscribe,
//! enable pollers.

use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::catalog::{
    PRODUCT_LABEL_ATTRIBUTE_PATH, PRODUCT_NAME_ATTRIBUTE_PATH, check_polled_attributes,
};
use crate::error::{ControllerError, Result};
use crate::model::DATA_MODEL_SCHEMA_VERSION;
use crate::stack::StackError;

use super::MatterController;

/// Interval at which a long-running setup is reported.
const SETUP_WATCHDOG_INTERVAL: Duration = Duration::from_secs(15 * 60);

impl MatterController {
    /// Bring a known node up: the only entry point for (re)establishing
    /// subscriptions. Idempotent while a setup for the node is in flight.
    ///
    /// Setup failures are not fatal: the node stays in the store, marked
    /// unavailable, and mDNS rediscovery (or the fallback scanner) retries.
    pub(crate) async fn setup_node(&self, node_id: u64) -> Result<()> {
        if !self.store.contains(node_id) {
            return Err(ControllerError::NodeNotExists(node_id));
        }
        if !self.nodes_in_setup.lock().insert(node_id) {
            // prevent duplicate setup actions
            return Ok(());
        }

        let Ok(_permit) = self.setup_semaphore.acquire().await else {
            // controller is shutting down
            self.nodes_in_setup.lock().remove(&node_id);
            return Ok(());
        };
        let watchdog = self.spawn_setup_watchdog(node_id, Instant::now());
        self.run_node_setup(node_id).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        self.nodes_in_setup.lock().remove(&node_id);
        Ok(())
    }

    async fn run_node_setup(&self, node_id: u64) {
        info!("Node {node_id}: setting-up node...");

        // try to resolve the node before doing anything else
        match self.stack.find_or_establish_case_session(node_id).await {
            Ok(()) => {}
            Err(StackError::NotResolving(_)) => {
                // the node will be picked up by mdns discovery automatically
                // when it comes available again
                warn!("Node {node_id}: setup failed: node is not resolving");
                return;
            }
            Err(err) => {
                warn!("Node {node_id}: setup failed: {err}");
                return;
            }
        }

        // (re)interview only if needed: empty node or outdated schema
        let needs_interview = self
            .store
            .get(node_id)
            .map(|node| {
                node.attributes.is_empty() || node.interview_version != DATA_MODEL_SCHEMA_VERSION
            })
            .unwrap_or(false);
        if needs_interview
            && let Err(err) = self.interview_node(node_id).await
        {
            warn!("Node {node_id}: setup failed: {err}");
            return;
        }

        if let Err(err) = self.subscribe_node(node_id).await {
            warn!("Node {node_id}: unable to subscribe: {err}");
            return;
        }

        // custom (vendor) clusters are not reported via the subscription and
        // need polling
        if let Some(node) = self.store.get(node_id) {
            let polled_attributes = check_polled_attributes(&node);
            if !polled_attributes.is_empty() {
                self.polled_attributes
                    .lock()
                    .insert(node_id, polled_attributes);
                self.schedule_custom_attributes_poller();
            }
        }
    }

    /// Report a setup that runs suspiciously long, every interval until it
    /// finishes. The node is never abandoned; the report is diagnostic only.
    fn spawn_setup_watchdog(&self, node_id: u64, started: Instant) -> Option<JoinHandle<()>> {
        let controller = self.strong()?;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SETUP_WATCHDOG_INTERVAL).await;
                let elapsed_mins = started.elapsed().as_secs() / 60;
                let node_model = controller
                    .store
                    .attribute(node_id, PRODUCT_LABEL_ATTRIBUTE_PATH)
                    .or_else(|| controller.store.attribute(node_id, PRODUCT_NAME_ATTRIBUTE_PATH))
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_default();
                let ip_address = match controller.stack.get_address_and_port(node_id).await {
                    Some((ip, _port)) => ip,
                    None => "unknown".to_string(),
                };
                error!(
                    "Node {node_id} ({node_model}) did not complete setup in {elapsed_mins} \
                     minutes. This is an indication of a (connectivity) issue with this device. \
                     IP address in use for this device: {ip_address}. Try power-cycling the \
                     device and/or relocating it closer to a Border Router or WiFi Access Point."
                );
            }
        });
        Some(handle)
    }

    /// Current bring-up backlog, for diagnostics.
    pub fn nodes_in_setup(&self) -> Vec<u64> {
        let mut nodes: Vec<u64> = self.nodes_in_setup.lock().iter().copied().collect();
        nodes.sort_unstable();
        nodes
    }
}
