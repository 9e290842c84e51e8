//! Narrow facade over the Matter SDK collaborator.
//!
//! Everything below the interaction model (PASE/CASE, TLV codec, subscription
//! transport) lives behind this trait; the controller only sees decoded
//! values and typed failures.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;

use crate::model::{CommissionableNodeData, CommissioningParameters, NodeEvent};
use crate::path::AttributePath;
use crate::value::AttributeValue;

#[derive(ThisError, Debug, Clone)]
pub enum StackError {
    #[error("{0}")]
    Stack(String),

    #[error("Node {0} is not resolving on the fabric")]
    NotResolving(u64),
}

/// Device discovery scope during commissioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    NetworkOnly,
    All,
}

/// Options for a long-lived attribute/event subscription.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// `(floor, ceiling)` reporting interval in seconds.
    pub report_interval: (u16, u16),
    pub auto_resubscribe: bool,
    /// Urgency filter for the wildcard event subscription.
    pub event_urgency: u8,
    pub fabric_filtered: bool,
}

/// Initial state delivered when a subscription is established.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Granted `(floor, ceiling)` in seconds.
    pub report_interval: (u16, u16),
}

/// One notification from an active subscription.
///
/// The stack delivers these from its own worker thread; the supervisor drains
/// them on the controller side and performs all state mutation there.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    AttributeReport {
        path: String,
        value: AttributeValue,
    },
    Event(NodeEvent),
    Error {
        code: u32,
    },
    ResubscriptionAttempted {
        termination_error: u32,
        next_resubscribe_ms: u64,
    },
    ResubscriptionSucceeded,
}

#[derive(Debug, Clone)]
pub struct SubscriptionMessage {
    pub node_id: u64,
    pub update: SubscriptionUpdate,
}

/// A typed attribute write, already coerced to the declared attribute type.
#[derive(Debug, Clone)]
pub struct AttributeWrite {
    pub cluster_id: u32,
    pub attribute_id: u32,
    pub value: AttributeValue,
}

/// A cluster command invocation.
#[derive(Debug, Clone)]
pub struct ClusterCommand {
    pub cluster_id: u32,
    pub name: String,
    pub payload: JsonValue,
}

#[async_trait]
pub trait MatterStack: Send + Sync {
    async fn compressed_fabric_id(&self) -> Result<u64, StackError>;

    async fn commission_with_code(
        &self,
        node_id: u64,
        code: &str,
        discovery_mode: DiscoveryMode,
    ) -> Result<(), StackError>;

    async fn commission_on_network(
        &self,
        node_id: u64,
        setup_pin_code: u32,
        filter_type: u32,
        filter: Option<JsonValue>,
    ) -> Result<(), StackError>;

    async fn commission_ip(
        &self,
        node_id: u64,
        setup_pin_code: u32,
        ip_addr: &str,
    ) -> Result<(), StackError>;

    async fn set_wifi_credentials(&self, ssid: &str, credentials: &str) -> Result<(), StackError>;

    async fn set_thread_operational_dataset(&self, dataset: &[u8]) -> Result<(), StackError>;

    async fn open_commissioning_window(
        &self,
        node_id: u64,
        timeout_s: u32,
        iteration: u32,
        discriminator: u16,
        option: u8,
    ) -> Result<CommissioningParameters, StackError>;

    async fn discover_commissionable_nodes(
        &self,
    ) -> Result<Vec<CommissionableNodeData>, StackError>;

    /// One-shot read of the given paths, decoded to an attribute-path map.
    async fn read_attributes(
        &self,
        node_id: u64,
        paths: &[AttributePath],
        fabric_filtered: bool,
    ) -> Result<BTreeMap<String, AttributeValue>, StackError>;

    /// Establish a wildcard attribute/event subscription. Updates flow into
    /// `updates` until the subscription is shut down.
    async fn subscribe_attributes(
        &self,
        node_id: u64,
        options: SubscribeOptions,
        updates: mpsc::Sender<SubscriptionMessage>,
    ) -> Result<SubscriptionSnapshot, StackError>;

    async fn write_attribute(
        &self,
        node_id: u64,
        endpoint_id: u16,
        write: AttributeWrite,
    ) -> Result<(), StackError>;

    async fn send_command(
        &self,
        node_id: u64,
        endpoint_id: u16,
        command: ClusterCommand,
        timed_request_timeout_ms: Option<u32>,
        interaction_timeout_ms: Option<u32>,
    ) -> Result<Option<AttributeValue>, StackError>;

    async fn shutdown_subscription(&self, node_id: u64) -> Result<(), StackError>;

    fn node_has_subscription(&self, node_id: u64) -> bool;

    async fn find_or_establish_case_session(&self, node_id: u64) -> Result<(), StackError>;

    /// Address and port the SDK currently uses to reach the node, if any.
    async fn get_address_and_port(&self, node_id: u64) -> Option<(String, u16)>;

    async fn shutdown(&self) -> Result<(), StackError>;
}
