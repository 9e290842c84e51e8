//! Fake collaborators for controller tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::mdns::{MdnsBrowser, ServiceEvent, ServiceInfo};
use crate::model::{
    CommissionableNodeData, CommissioningParameters, DATA_MODEL_SCHEMA_VERSION, NodeRecord,
};
use crate::path::AttributePath;
use crate::ping::Pinger;
use crate::stack::{
    AttributeWrite, ClusterCommand, DiscoveryMode, MatterStack, StackError, SubscribeOptions,
    SubscriptionMessage, SubscriptionSnapshot, SubscriptionUpdate,
};
use crate::storage::MemoryStorage;
use crate::value::AttributeValue;

use super::MatterController;

pub(crate) const FAKE_FABRIC_ID: u64 = 0xABCD_EF12_3456_7890;

/// Scripted in-memory Matter stack.
pub(crate) struct FakeStack {
    /// Upcoming commissioning outcomes; empty queue means success.
    pub commission_results: Mutex<VecDeque<Result<(), StackError>>>,
    /// Wildcard-read (interview) data per node; missing node means failure.
    pub node_data: Mutex<HashMap<u64, BTreeMap<String, AttributeValue>>>,
    /// Nodes that fail CASE establishment with NotResolving.
    pub unresolvable_nodes: Mutex<Vec<u64>>,
    /// Upcoming subscribe outcomes; empty queue means success.
    pub subscribe_results: Mutex<VecDeque<Result<(), StackError>>>,
    /// Active subscription senders per node.
    subscriptions: Mutex<HashMap<u64, mpsc::Sender<SubscriptionMessage>>>,
    /// Options of the last subscribe call per node.
    pub subscribe_options: Mutex<HashMap<u64, SubscribeOptions>>,
    /// Upcoming command responses; empty queue means None.
    pub command_responses: Mutex<VecDeque<Option<AttributeValue>>>,
    /// Address the SDK pretends to use per node.
    pub active_address: Mutex<Option<(String, u16)>>,
    pub discovered: Mutex<Vec<CommissionableNodeData>>,
    /// Call journal: "method:node_id[:extra]".
    pub calls: Mutex<Vec<String>>,
}

impl FakeStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            commission_results: Mutex::new(VecDeque::new()),
            node_data: Mutex::new(HashMap::new()),
            unresolvable_nodes: Mutex::new(Vec::new()),
            subscribe_results: Mutex::new(VecDeque::new()),
            subscriptions: Mutex::new(HashMap::new()),
            subscribe_options: Mutex::new(HashMap::new()),
            command_responses: Mutex::new(VecDeque::new()),
            active_address: Mutex::new(None),
            discovered: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Deliver a subscription update the way the SDK worker thread would.
    pub async fn push_update(&self, node_id: u64, update: SubscriptionUpdate) {
        let sender = self
            .subscriptions
            .lock()
            .get(&node_id)
            .cloned()
            .expect("no active subscription for node");
        sender
            .send(SubscriptionMessage { node_id, update })
            .await
            .expect("subscription channel closed");
    }
}

#[async_trait]
impl MatterStack for FakeStack {
    async fn compressed_fabric_id(&self) -> Result<u64, StackError> {
        Ok(FAKE_FABRIC_ID)
    }

    async fn commission_with_code(
        &self,
        node_id: u64,
        _code: &str,
        _discovery_mode: DiscoveryMode,
    ) -> Result<(), StackError> {
        self.record(format!("commission_with_code:{node_id}"));
        self.commission_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn commission_on_network(
        &self,
        node_id: u64,
        _setup_pin_code: u32,
        _filter_type: u32,
        _filter: Option<JsonValue>,
    ) -> Result<(), StackError> {
        self.record(format!("commission_on_network:{node_id}"));
        self.commission_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn commission_ip(
        &self,
        node_id: u64,
        _setup_pin_code: u32,
        ip_addr: &str,
    ) -> Result<(), StackError> {
        self.record(format!("commission_ip:{node_id}:{ip_addr}"));
        self.commission_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn set_wifi_credentials(&self, ssid: &str, _credentials: &str) -> Result<(), StackError> {
        self.record(format!("set_wifi_credentials:{ssid}"));
        Ok(())
    }

    async fn set_thread_operational_dataset(&self, dataset: &[u8]) -> Result<(), StackError> {
        self.record(format!("set_thread_operational_dataset:{}", dataset.len()));
        Ok(())
    }

    async fn open_commissioning_window(
        &self,
        node_id: u64,
        _timeout_s: u32,
        _iteration: u32,
        discriminator: u16,
        _option: u8,
    ) -> Result<CommissioningParameters, StackError> {
        self.record(format!("open_commissioning_window:{node_id}"));
        Ok(CommissioningParameters {
            setup_pin_code: 20202021,
            setup_manual_code: "36296231169".to_string(),
            setup_qr_code: format!("MT:FAKE-{discriminator}"),
        })
    }

    async fn discover_commissionable_nodes(
        &self,
    ) -> Result<Vec<CommissionableNodeData>, StackError> {
        self.record("discover_commissionable_nodes");
        Ok(self.discovered.lock().clone())
    }

    async fn read_attributes(
        &self,
        node_id: u64,
        paths: &[AttributePath],
        _fabric_filtered: bool,
    ) -> Result<BTreeMap<String, AttributeValue>, StackError> {
        self.record(format!("read_attributes:{node_id}"));
        let data = self
            .node_data
            .lock()
            .get(&node_id)
            .cloned()
            .ok_or_else(|| StackError::Stack(format!("read failed for node {node_id}")))?;
        Ok(data
            .into_iter()
            .filter(|(key, _)| paths.iter().any(|path| path_matches(path, key)))
            .collect())
    }

    async fn subscribe_attributes(
        &self,
        node_id: u64,
        options: SubscribeOptions,
        updates: mpsc::Sender<SubscriptionMessage>,
    ) -> Result<SubscriptionSnapshot, StackError> {
        self.record(format!("subscribe_attributes:{node_id}"));
        self.subscribe_options.lock().insert(node_id, options);
        if let Some(result) = self.subscribe_results.lock().pop_front() {
            result?;
        }
        self.subscriptions.lock().insert(node_id, updates);
        Ok(SubscriptionSnapshot {
            attributes: self.node_data.lock().get(&node_id).cloned().unwrap_or_default(),
            report_interval: options.report_interval,
        })
    }

    async fn write_attribute(
        &self,
        node_id: u64,
        endpoint_id: u16,
        write: AttributeWrite,
    ) -> Result<(), StackError> {
        self.record(format!(
            "write_attribute:{node_id}:{endpoint_id}/{}/{}",
            write.cluster_id, write.attribute_id
        ));
        Ok(())
    }

    async fn send_command(
        &self,
        node_id: u64,
        endpoint_id: u16,
        command: ClusterCommand,
        _timed_request_timeout_ms: Option<u32>,
        _interaction_timeout_ms: Option<u32>,
    ) -> Result<Option<AttributeValue>, StackError> {
        self.record(format!(
            "send_command:{node_id}:{endpoint_id}:{}",
            command.name
        ));
        Ok(self.command_responses.lock().pop_front().unwrap_or(None))
    }

    async fn shutdown_subscription(&self, node_id: u64) -> Result<(), StackError> {
        self.record(format!("shutdown_subscription:{node_id}"));
        self.subscriptions.lock().remove(&node_id);
        Ok(())
    }

    fn node_has_subscription(&self, node_id: u64) -> bool {
        self.subscriptions.lock().contains_key(&node_id)
    }

    async fn find_or_establish_case_session(&self, node_id: u64) -> Result<(), StackError> {
        self.record(format!("find_or_establish_case_session:{node_id}"));
        if self.unresolvable_nodes.lock().contains(&node_id) {
            return Err(StackError::NotResolving(node_id));
        }
        Ok(())
    }

    async fn get_address_and_port(&self, _node_id: u64) -> Option<(String, u16)> {
        self.active_address.lock().clone()
    }

    async fn shutdown(&self) -> Result<(), StackError> {
        self.record("shutdown");
        Ok(())
    }
}

fn path_matches(path: &AttributePath, key: &str) -> bool {
    let mut parts = key.split('/');
    let (Some(endpoint), Some(cluster), Some(attribute)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    fn component_matches<T: std::str::FromStr + PartialEq>(want: Option<T>, got: &str) -> bool {
        match want {
            None => true,
            Some(want) => got.parse::<T>().map(|got| got == want).unwrap_or(false),
        }
    }
    component_matches(path.endpoint_id, endpoint)
        && component_matches(path.cluster_id, cluster)
        && component_matches(path.attribute_id, attribute)
}

/// Browser fake: hands the controller's event sender back to the test.
#[derive(Default)]
pub(crate) struct FakeBrowser {
    events_tx: Mutex<Option<mpsc::Sender<ServiceEvent>>>,
    pub infos: Mutex<HashMap<String, ServiceInfo>>,
}

impl FakeBrowser {
    pub async fn send_event(&self, event: ServiceEvent) {
        let sender = self
            .events_tx
            .lock()
            .clone()
            .expect("browser not started");
        sender.send(event).await.expect("mdns channel closed");
    }
}

#[async_trait]
impl MdnsBrowser for FakeBrowser {
    async fn browse(&self, _service_types: &[String], events: mpsc::Sender<ServiceEvent>) {
        *self.events_tx.lock() = Some(events);
    }

    async fn query_service_info(
        &self,
        _service_type: &str,
        name: &str,
        _timeout: Duration,
    ) -> Option<ServiceInfo> {
        self.infos.lock().get(name).cloned()
    }

    async fn shutdown(&self) {}
}

/// Pinger fake with per-address scripted reachability.
#[derive(Default)]
pub(crate) struct FakePinger {
    pub reachable: Mutex<HashMap<String, bool>>,
}

#[async_trait]
impl Pinger for FakePinger {
    async fn ping(&self, ip_address: &str, _timeout: Duration, _attempts: u32) -> bool {
        self.reachable
            .lock()
            .get(ip_address)
            .copied()
            .unwrap_or(false)
    }
}

pub(crate) struct TestContext {
    pub controller: Arc<MatterController>,
    pub stack: Arc<FakeStack>,
    pub browser: Arc<FakeBrowser>,
    pub pinger: Arc<FakePinger>,
    pub storage: Arc<MemoryStorage>,
}

/// A fully started controller over fake collaborators and empty storage.
pub(crate) async fn new_controller() -> TestContext {
    let storage = Arc::new(MemoryStorage::new());
    let stack = FakeStack::new();
    let browser = Arc::new(FakeBrowser::default());
    let pinger = Arc::new(FakePinger::default());
    let controller = MatterController::new(
        storage.clone(),
        stack.clone(),
        browser.clone(),
        pinger.clone(),
    );
    controller.initialize().await.expect("initialize");
    controller.start().await.expect("start");
    TestContext {
        controller,
        stack,
        browser,
        pinger,
        storage,
    }
}

/// A plain interviewed-looking node record for seeding the store.
pub(crate) fn make_node(node_id: u64, attributes: &[(&str, AttributeValue)]) -> NodeRecord {
    NodeRecord {
        node_id,
        date_commissioned: Utc::now(),
        last_interview: Utc::now(),
        interview_version: DATA_MODEL_SCHEMA_VERSION,
        available: false,
        is_bridge: false,
        attributes: attributes
            .iter()
            .map(|(path, value)| (path.to_string(), value.clone()))
            .collect(),
        attribute_subscriptions: Vec::new(),
    }
}
