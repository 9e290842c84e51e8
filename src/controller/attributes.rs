//! Attribute read/write and device command handlers.

use std::collections::BTreeMap;

use log::debug;
use serde_json::Value as JsonValue;

use crate::catalog::{attribute_type, parse_value};
use crate::error::{ControllerError, Result};
use crate::events::ServerEvent;
use crate::model::TEST_NODE_START;
use crate::path::AttributePath;
use crate::stack::{AttributeWrite, ClusterCommand};
use crate::value::AttributeValue;

use super::MatterController;

impl MatterController {
    /// Read one or more attribute paths (wildcards allowed for cluster and
    /// attribute id). Changed values are written back to the cache and
    /// announced as `attribute_updated`.
    pub async fn read_attribute(
        &self,
        node_id: u64,
        attribute_paths: &[String],
        fabric_filtered: bool,
    ) -> Result<BTreeMap<String, AttributeValue>> {
        let node = self
            .store
            .get(node_id)
            .filter(|node| node.available)
            .ok_or(ControllerError::NodeNotReady(node_id))?;

        if node_id >= TEST_NODE_START {
            debug!(
                "read_attribute called for test node {node_id} on path(s) {attribute_paths:?} \
                 - fabric_filtered: {fabric_filtered}"
            );
            return Ok(attribute_paths
                .iter()
                .map(|path| {
                    let value = node
                        .attributes
                        .get(path)
                        .cloned()
                        .unwrap_or(AttributeValue::Null);
                    (path.clone(), value)
                })
                .collect());
        }

        let paths = attribute_paths
            .iter()
            .map(|path| path.parse::<AttributePath>())
            .collect::<Result<Vec<_>>>()?;

        let read_attributes = self
            .stack
            .read_attributes(node_id, &paths, fabric_filtered)
            .await?;

        // update cached values and announce actual changes
        let mut values_changed = false;
        for (path, value) in &read_attributes {
            if self.store.attribute(node_id, path).as_ref() != Some(value) {
                self.store.update(node_id, |node| {
                    node.attributes.insert(path.clone(), value.clone());
                });
                self.events.emit(ServerEvent::AttributeUpdated {
                    node_id,
                    path: path.clone(),
                    value: value.clone(),
                });
                values_changed = true;
            }
        }
        if values_changed {
            self.store.schedule_write(node_id, false).await;
        }
        Ok(read_attributes)
    }

    /// Write a single attribute. The value is coerced into the attribute's
    /// declared type from the cluster catalog.
    pub async fn write_attribute(
        &self,
        node_id: u64,
        attribute_path: &str,
        value: &JsonValue,
    ) -> Result<Option<AttributeValue>> {
        let node = self.store.get(node_id);
        if !node.map(|node| node.available).unwrap_or(false) {
            return Err(ControllerError::NodeNotReady(node_id));
        }

        let path: AttributePath = attribute_path.parse()?;
        let (Some(endpoint_id), Some(cluster_id), Some(attribute_id)) =
            (path.endpoint_id, path.cluster_id, path.attribute_id)
        else {
            return Err(ControllerError::InvalidArguments(format!(
                "Invalid attribute path: {attribute_path}"
            )));
        };
        let declared_type = attribute_type(cluster_id, attribute_id).ok_or_else(|| {
            ControllerError::InvalidArguments(format!("Unknown attribute: {attribute_path}"))
        })?;
        let value = parse_value(attribute_path, value, declared_type)?;

        if node_id >= TEST_NODE_START {
            debug!(
                "write_attribute called for test node {node_id} on path {attribute_path} \
                 - value {value:?}"
            );
            return Ok(None);
        }

        self.stack
            .write_attribute(
                node_id,
                endpoint_id,
                AttributeWrite {
                    cluster_id,
                    attribute_id,
                    value,
                },
            )
            .await?;
        Ok(None)
    }

    /// Send a cluster command to a node endpoint.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_device_command(
        &self,
        node_id: u64,
        endpoint_id: u16,
        cluster_id: u32,
        command_name: &str,
        payload: JsonValue,
        timed_request_timeout_ms: Option<u32>,
        interaction_timeout_ms: Option<u32>,
    ) -> Result<Option<AttributeValue>> {
        let node = self.store.get(node_id);
        if !node.map(|node| node.available).unwrap_or(false) {
            return Err(ControllerError::NodeNotReady(node_id));
        }
        let command = ClusterCommand {
            cluster_id,
            name: command_name.to_string(),
            payload,
        };
        if node_id >= TEST_NODE_START {
            debug!(
                "send_device_command called for test node {node_id} on endpoint {endpoint_id} \
                 - cluster: {cluster_id} - command: {command_name}"
            );
            return Ok(None);
        }
        Ok(self
            .stack
            .send_command(
                node_id,
                endpoint_id,
                command,
                timed_request_timeout_ms,
                interaction_timeout_ms,
            )
            .await?)
    }
}
