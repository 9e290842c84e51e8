//! Commissioning, interview and removal flows.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use rand::Rng;
use serde_json::{Value as JsonValue, json};

use crate::catalog::{
    BRIDGE_DEVICE_TYPE_LIST_PATH, CLUSTER_ID_OPERATIONAL_CREDENTIALS,
    CURRENT_FABRIC_INDEX_ATTRIBUTE_PATH, DEVICE_TYPE_BRIDGE, device_type_list_contains,
};
use crate::error::{ControllerError, Result};
use crate::events::ServerEvent;
use crate::model::{
    CommissioningParameters, DATA_MODEL_SCHEMA_VERSION, NodeRecord, TEST_NODE_START,
};
use crate::path::AttributePath;
use crate::stack::{ClusterCommand, DiscoveryMode, StackError};
use crate::value::AttributeValue;

use super::MatterController;

/// Commissioning retries on top of the initial attempt. Devices in the wild
/// can be unstable; retrying raises the success rate considerably.
const MAX_COMMISSION_RETRIES: u32 = 3;
const COMMISSION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// First-interview attempts; noisy RF environments and mdns trouble make the
/// first read flaky.
const MAX_INTERVIEW_RETRIES: u32 = 3;
const INTERVIEW_RETRY_DELAY: Duration = Duration::from_secs(5);

impl MatterController {
    /// Commission a device using a QR code or manual pairing code. Returns
    /// the fully interviewed node.
    pub async fn commission_with_code(
        &self,
        code: &str,
        network_only: bool,
    ) -> Result<NodeRecord> {
        let node_id = self.id_allocator.next_id().await?;
        let discovery_mode = if network_only {
            DiscoveryMode::NetworkOnly
        } else {
            DiscoveryMode::All
        };

        let total_attempts = MAX_COMMISSION_RETRIES + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(
                "Starting Matter commissioning with code using node id {node_id} \
                 (attempt {attempt}/{total_attempts})"
            );
            match self
                .stack
                .commission_with_code(node_id, code, discovery_mode)
                .await
            {
                Ok(()) => break,
                Err(err) => {
                    if attempt >= total_attempts {
                        warn!("Commission with code failed for node {node_id}: {err}");
                        return Err(ControllerError::NodeCommissionFailed(node_id));
                    }
                    warn!("Commissioning attempt {attempt} for node {node_id} failed: {err}");
                    tokio::time::sleep(COMMISSION_RETRY_DELAY).await;
                }
            }
        }
        info!("Matter commissioning of node {node_id} successful");

        self.first_interview(node_id).await?;
        let _ = self.setup_node(node_id).await;
        info!("Commissioning of node {node_id} completed");
        self.get_node(node_id)
    }

    /// On-network commissioning with an mDNS discovery filter, or directly by
    /// IP when one is supplied. For advanced use cases; regular commissioning
    /// goes through [`MatterController::commission_with_code`].
    pub async fn commission_on_network(
        &self,
        setup_pin_code: u32,
        filter_type: u32,
        filter: Option<JsonValue>,
        ip_addr: Option<&str>,
    ) -> Result<NodeRecord> {
        let node_id = self.id_allocator.next_id().await?;

        let total_attempts = MAX_COMMISSION_RETRIES + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match ip_addr {
                None => {
                    info!(
                        "Starting Matter commissioning on network using node id {node_id} \
                         (attempt {attempt}/{total_attempts})"
                    );
                    self.stack
                        .commission_on_network(node_id, setup_pin_code, filter_type, filter.clone())
                        .await
                }
                Some(ip_addr) => {
                    info!(
                        "Starting Matter commissioning using node id {node_id} and IP {ip_addr} \
                         (attempt {attempt}/{total_attempts})"
                    );
                    self.stack
                        .commission_ip(node_id, setup_pin_code, ip_addr)
                        .await
                }
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if attempt >= total_attempts {
                        warn!("Commissioning failed for node {node_id}: {err}");
                        return Err(ControllerError::NodeCommissionFailed(node_id));
                    }
                    warn!("Commissioning attempt {attempt} for node {node_id} failed: {err}");
                    tokio::time::sleep(COMMISSION_RETRY_DELAY).await;
                }
            }
        }
        info!("Matter commissioning of node {node_id} successful");

        self.first_interview(node_id).await?;
        let _ = self.setup_node(node_id).await;
        info!("Commissioning of node {node_id} completed");
        self.get_node(node_id)
    }

    /// First interview of a freshly commissioned node, with retries for
    /// resolve/interview hiccups. Surfaces the last error when exhausted.
    async fn first_interview(&self, node_id: u64) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.interview_node(node_id).await {
                Ok(()) => return Ok(()),
                Err(
                    err @ (ControllerError::NodeNotResolving(_)
                    | ControllerError::NodeInterviewFailed(_)),
                ) => {
                    if attempt >= MAX_INTERVIEW_RETRIES {
                        return Err(err);
                    }
                    warn!("Unable to interview node {node_id}: {err}");
                    tokio::time::sleep(INTERVIEW_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Full wildcard read of the node's data model, replacing the stored
    /// record. Emits `node_added` on first interview, `node_updated` after.
    pub async fn interview_node(&self, node_id: u64) -> Result<()> {
        if node_id >= TEST_NODE_START {
            debug!("interview_node called for test node {node_id}");
            if let Some(node) = self.store.get(node_id) {
                self.events.emit(ServerEvent::NodeUpdated(node));
            }
            return Ok(());
        }

        info!("Interviewing node: {node_id}");
        let attributes = self
            .stack
            .read_attributes(node_id, &[AttributePath::WILDCARD], false)
            .await
            .map_err(|err| match err {
                StackError::NotResolving(_) => ControllerError::NodeNotResolving(node_id),
                StackError::Stack(_) => ControllerError::NodeInterviewFailed(node_id),
            })?;

        let existing = self.store.get(node_id);
        let is_new_node = existing.is_none();
        let mut node = NodeRecord {
            node_id,
            date_commissioned: existing
                .as_ref()
                .map(|node| node.date_commissioned)
                .unwrap_or_else(Utc::now),
            last_interview: Utc::now(),
            interview_version: DATA_MODEL_SCHEMA_VERSION,
            available: existing.as_ref().map(|node| node.available).unwrap_or(false),
            is_bridge: false,
            attributes,
            attribute_subscriptions: existing
                .map(|node| node.attribute_subscriptions)
                .unwrap_or_default(),
        };
        // a bridge announces itself via the device type of endpoint 1
        node.is_bridge = node
            .attributes
            .get(BRIDGE_DEVICE_TYPE_LIST_PATH)
            .map(|value| device_type_list_contains(value, DEVICE_TYPE_BRIDGE))
            .unwrap_or(false);

        self.store.upsert(node.clone());
        self.store.schedule_write(node_id, true).await;
        if is_new_node {
            self.events.emit(ServerEvent::NodeAdded(node));
        } else {
            self.events.emit(ServerEvent::NodeUpdated(node));
        }
        debug!("Interview of node {node_id} completed");
        Ok(())
    }

    /// Open a commissioning window so the node can be commissioned onto
    /// another fabric. Parameters are cached until the window times out.
    pub async fn open_commissioning_window(
        &self,
        node_id: u64,
        timeout: u32,
        iteration: u32,
        option: u8,
        discriminator: Option<u16>,
    ) -> Result<CommissioningParameters> {
        let node = self.store.get(node_id);
        if !node.map(|node| node.available).unwrap_or(false) {
            return Err(ControllerError::NodeNotReady(node_id));
        }

        if let Some(params) = self.known_commissioning_params.lock().get(&node_id) {
            // window is already open, return the previous parameters
            return Ok(params.clone());
        }

        let discriminator =
            discriminator.unwrap_or_else(|| rand::thread_rng().gen_range(0..=4095));
        let params = self
            .stack
            .open_commissioning_window(node_id, timeout, iteration, discriminator, option)
            .await?;
        self.known_commissioning_params
            .lock()
            .insert(node_id, params.clone());

        // drop the cached parameters once the window has expired
        if let Some(controller) = self.strong() {
            self.debouncer.schedule(
                &format!("commissioning_window/{node_id}"),
                Duration::from_secs(timeout as u64),
                move || async move {
                    controller.known_commissioning_params.lock().remove(&node_id);
                },
            );
        }
        Ok(params)
    }

    /// Remove a node from the fabric. Best-effort asks the device to drop our
    /// fabric credentials; failure to do so never fails the removal.
    pub async fn remove_node(&self, node_id: u64) -> Result<()> {
        if !self.store.contains(node_id) {
            return Err(ControllerError::NodeNotExists(node_id));
        }

        info!("Removing node {node_id}");
        if let Err(err) = self.stack.shutdown_subscription(node_id).await {
            debug!("Shutting down subscription for node {node_id} failed: {err}");
        }
        self.polled_attributes.lock().remove(&node_id);
        self.subscription_states.lock().remove(&node_id);
        self.node_last_seen.lock().remove(&node_id);
        self.last_known_ip_addresses.lock().remove(&node_id);

        let node = self.store.take(node_id);
        self.store.remove_persisted(node_id).await;
        info!("Node {node_id} successfully removed");
        self.events.emit(ServerEvent::NodeRemoved { node_id });

        let Some(node) = node else {
            return Ok(());
        };
        if node.is_test_node() {
            return Ok(());
        }

        let Some(fabric_index) = node
            .attributes
            .get(CURRENT_FABRIC_INDEX_ATTRIBUTE_PATH)
            .and_then(AttributeValue::as_u64)
        else {
            return Ok(());
        };
        let command = ClusterCommand {
            cluster_id: CLUSTER_ID_OPERATIONAL_CREDENTIALS,
            name: "RemoveFabric".to_string(),
            payload: json!({ "fabricIndex": fabric_index }),
        };
        match self.stack.send_command(node_id, 0, command, None, None).await {
            Err(err) => {
                warn!("Removing current fabric from device failed: {err}");
            }
            Ok(response) => {
                let status_code = response
                    .as_ref()
                    .and_then(|value| match value {
                        AttributeValue::Map(fields) => {
                            fields.get("statusCode").and_then(AttributeValue::as_u64)
                        }
                        _ => None,
                    })
                    .unwrap_or(0);
                if status_code == 0 {
                    info!("Successfully removed controller fabric from device");
                } else {
                    warn!("Removing current fabric from device failed with status code {status_code}");
                }
            }
        }
        Ok(())
    }
}
