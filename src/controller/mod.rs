//! The device controller: long-lived owner of every per-node state machine.
//!
//! All collaborators (Matter stack, storage, mDNS browser, pinger) are
//! injected at construction so tests can supply fakes. Subscription callbacks
//! arrive from the stack's worker thread as messages on a bounded channel and
//! are drained by a single supervisor task; see `subscription.rs`.

mod attributes;
mod commission;
mod discovery;
mod mdns_router;
mod poller;
mod setup;
mod store;
mod subscription;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::debounce::Debouncer;
use crate::error::{ControllerError, Result};
use crate::events::{EventBus, ServerEvent};
use crate::mdns::{MDNS_TYPE_COMMISSIONABLE_NODE, MDNS_TYPE_OPERATIONAL_NODE, MdnsBrowser};
use crate::model::{
    CommissionableNodeData, CommissioningParameters, NodeEvent, NodeRecord, TEST_NODE_START,
};
use crate::ping::Pinger;
use crate::stack::{MatterStack, SubscriptionMessage};
use crate::storage::Storage;
use crate::value::decode_hex;

use self::store::{IdAllocator, NodeStore};
use self::subscription::SubscriptionState;

const EVENT_BUS_CAPACITY: usize = 64;
const MDNS_CHANNEL_CAPACITY: usize = 64;
const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 256;

/// Maximum number of node bring-ups running concurrently.
const NODE_SETUP_CONCURRENCY: usize = 5;

/// Diagnostics ring of the most recent node events.
const EVENT_HISTORY_LEN: usize = 25;

/// Manages the Matter nodes commissioned onto this controller's fabric.
pub struct MatterController {
    /// Self-handle for spawning background tasks from `&self` methods.
    weak_self: Weak<MatterController>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) stack: Arc<dyn MatterStack>,
    pub(crate) browser: Arc<dyn MdnsBrowser>,
    pub(crate) pinger: Arc<dyn Pinger>,
    pub(crate) events: EventBus,
    pub(crate) debouncer: Debouncer,
    pub(crate) store: NodeStore,
    pub(crate) id_allocator: IdAllocator,

    compressed_fabric_id: OnceLock<u64>,
    fabric_id_hex: OnceLock<String>,
    wifi_credentials_set: AtomicBool,
    thread_credentials_set: AtomicBool,

    pub(crate) nodes_in_setup: Mutex<HashSet<u64>>,
    pub(crate) node_last_seen: Mutex<HashMap<u64, Instant>>,
    pub(crate) last_known_ip_addresses: Mutex<HashMap<u64, Vec<String>>>,
    pub(crate) known_commissioning_params: Mutex<HashMap<u64, CommissioningParameters>>,
    pub(crate) polled_attributes: Mutex<HashMap<u64, BTreeSet<String>>>,
    pub(crate) subscription_states: Mutex<HashMap<u64, SubscriptionState>>,
    pub(crate) event_history: Mutex<VecDeque<NodeEvent>>,

    pub(crate) setup_semaphore: Semaphore,
    pub(crate) shutdown: CancellationToken,

    subscription_tx: mpsc::Sender<SubscriptionMessage>,
    subscription_rx: Mutex<Option<mpsc::Receiver<SubscriptionMessage>>>,

    mdns_task: Mutex<Option<JoinHandle<()>>>,
    subscription_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) fallback_scan_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) poller_task: Mutex<Option<JoinHandle<()>>>,
}

impl MatterController {
    pub fn new(
        storage: Arc<dyn Storage>,
        stack: Arc<dyn MatterStack>,
        browser: Arc<dyn MdnsBrowser>,
        pinger: Arc<dyn Pinger>,
    ) -> Arc<Self> {
        let (subscription_tx, subscription_rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            store: NodeStore::new(Arc::clone(&storage)),
            id_allocator: IdAllocator::new(Arc::clone(&storage)),
            storage,
            stack,
            browser,
            pinger,
            events: EventBus::new(EVENT_BUS_CAPACITY),
            debouncer: Debouncer::new(),
            compressed_fabric_id: OnceLock::new(),
            fabric_id_hex: OnceLock::new(),
            wifi_credentials_set: AtomicBool::new(false),
            thread_credentials_set: AtomicBool::new(false),
            nodes_in_setup: Mutex::new(HashSet::new()),
            node_last_seen: Mutex::new(HashMap::new()),
            last_known_ip_addresses: Mutex::new(HashMap::new()),
            known_commissioning_params: Mutex::new(HashMap::new()),
            polled_attributes: Mutex::new(HashMap::new()),
            subscription_states: Mutex::new(HashMap::new()),
            event_history: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY_LEN)),
            setup_semaphore: Semaphore::new(NODE_SETUP_CONCURRENCY),
            shutdown: CancellationToken::new(),
            subscription_tx,
            subscription_rx: Mutex::new(Some(subscription_rx)),
            mdns_task: Mutex::new(None),
            subscription_task: Mutex::new(None),
            fallback_scan_task: Mutex::new(None),
            poller_task: Mutex::new(None),
        })
    }

    /// Upgrade the self-handle; None only while the controller is dropping.
    pub(crate) fn strong(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    /// Resolve the fabric identity from the stack. Must run before `start`.
    pub async fn initialize(&self) -> Result<()> {
        let fabric_id = self.stack.compressed_fabric_id().await?;
        let _ = self.compressed_fabric_id.set(fabric_id);
        let _ = self.fabric_id_hex.set(format!("{fabric_id:x}"));
        Ok(())
    }

    /// Load persisted nodes and start the background machinery: subscription
    /// drain task, mDNS browser and router, fallback node scanner.
    pub async fn start(&self) -> Result<()> {
        self.storage.start().await?;
        let loaded = self.store.load().await;
        log::info!("Loaded {loaded} nodes from stored configuration");

        if let Some(rx) = self.subscription_rx.lock().take()
            && let Some(controller) = self.strong()
        {
            *self.subscription_task.lock() =
                Some(tokio::spawn(controller.run_subscription_loop(rx)));
        }

        let (mdns_tx, mdns_rx) = mpsc::channel(MDNS_CHANNEL_CAPACITY);
        self.browser
            .browse(
                &[
                    MDNS_TYPE_OPERATIONAL_NODE.to_string(),
                    MDNS_TYPE_COMMISSIONABLE_NODE.to_string(),
                ],
                mdns_tx,
            )
            .await;
        if let Some(controller) = self.strong() {
            *self.mdns_task.lock() = Some(tokio::spawn(controller.run_mdns_router(mdns_rx)));
        }

        self.schedule_fallback_scanner();
        Ok(())
    }

    /// Stop background work, flush storage and shut the stack down.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.browser.shutdown().await;
        // pending mDNS debounces, window clearers, scanner and poller timers
        self.debouncer.cancel_all();
        for slot in [
            &self.mdns_task,
            &self.subscription_task,
            &self.fallback_scan_task,
            &self.poller_task,
        ] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
        self.setup_semaphore.close();
        if let Err(err) = self.storage.stop().await {
            warn!("Flushing storage failed: {err}");
        }
        if let Err(err) = self.stack.shutdown().await {
            warn!("Matter stack shutdown failed: {err}");
        }
        debug!("Stopped");
    }

    pub fn compressed_fabric_id(&self) -> Option<u64> {
        self.compressed_fabric_id.get().copied()
    }

    pub(crate) fn fabric_id_hex(&self) -> Option<&str> {
        self.fabric_id_hex.get().map(String::as_str)
    }

    pub fn wifi_credentials_set(&self) -> bool {
        self.wifi_credentials_set.load(Ordering::Relaxed)
    }

    pub fn thread_credentials_set(&self) -> bool {
        self.thread_credentials_set.load(Ordering::Relaxed)
    }

    /// Most recent node events, oldest first.
    pub fn event_history(&self) -> Vec<NodeEvent> {
        self.event_history.lock().iter().cloned().collect()
    }

    /// Subscribe to controller events (node/attribute/endpoint updates).
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Return all nodes known to the controller.
    pub fn get_nodes(&self, only_available: bool) -> Vec<NodeRecord> {
        self.store.list(only_available)
    }

    /// Return a single node.
    pub fn get_node(&self, node_id: u64) -> Result<NodeRecord> {
        self.store
            .get(node_id)
            .ok_or(ControllerError::NodeNotExists(node_id))
    }

    pub async fn set_wifi_credentials(&self, ssid: &str, credentials: &str) -> Result<()> {
        self.stack.set_wifi_credentials(ssid, credentials).await?;
        self.wifi_credentials_set.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn set_thread_operational_dataset(&self, dataset: &str) -> Result<()> {
        let dataset = decode_hex(dataset).ok_or_else(|| {
            ControllerError::InvalidArguments("Thread dataset must be a hex string".to_string())
        })?;
        self.stack.set_thread_operational_dataset(&dataset).await?;
        self.thread_credentials_set.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn discover_commissionable_nodes(&self) -> Result<Vec<CommissionableNodeData>> {
        Ok(self.stack.discover_commissionable_nodes().await?)
    }

    /// Import test node(s) from a diagnostics dump (a single node dump or a
    /// full server dump). Imported nodes live in the synthetic range and are
    /// never persisted.
    pub fn import_test_node(&self, dump: &str) -> Result<()> {
        let dump: JsonValue = serde_json::from_str(dump)
            .map_err(|_| ControllerError::InvalidArguments("Invalid json".to_string()))?;
        let data = dump
            .get("data")
            .ok_or_else(|| ControllerError::InvalidArguments("Missing data section".to_string()))?;
        let dump_nodes: Vec<JsonValue> = if let Some(node) = data.get("node") {
            vec![node.clone()]
        } else {
            data.get("server")
                .and_then(|server| server.get("nodes"))
                .and_then(JsonValue::as_array)
                .cloned()
                .ok_or_else(|| {
                    ControllerError::InvalidArguments("No nodes found in dump".to_string())
                })?
        };

        let mut next_test_node_id =
            TEST_NODE_START.max(self.store.highest_node_id().unwrap_or(0)) + 1;
        for node_dict in dump_nodes {
            let mut node: NodeRecord = serde_json::from_value(node_dict).map_err(|err| {
                ControllerError::InvalidArguments(format!("Invalid node dump: {err}"))
            })?;
            node.node_id = next_test_node_id;
            next_test_node_id += 1;
            self.store.upsert(node.clone());
            self.events.emit(ServerEvent::NodeAdded(node));
        }
        Ok(())
    }

    pub(crate) fn touch_last_seen(&self, node_id: u64) {
        self.node_last_seen.lock().insert(node_id, Instant::now());
    }
}
