//! Node registry and node-id allocation backed by persistent storage.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use crate::error::{ControllerError, Result};
use crate::model::{NodeRecord, TEST_NODE_START};
use crate::storage::Storage;
use crate::value::AttributeValue;

pub(crate) const DATA_KEY_NODES: &str = "nodes";
pub(crate) const DATA_KEY_LAST_NODE_ID: &str = "last_node_id";

/// In-memory registry of node records, mirrored to durable storage.
///
/// The store is the exclusive owner of [`NodeRecord`]s; everything else works
/// on clones or through [`NodeStore::update`]. Locks are never held across
/// suspension points.
pub(crate) struct NodeStore {
    storage: Arc<dyn Storage>,
    nodes: RwLock<HashMap<u64, NodeRecord>>,
}

impl NodeStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Load all persisted records. Malformed entries degrade to a skeleton
    /// record that will be re-interviewed; null ("orphaned") entries are
    /// purged from storage. Every loaded record starts unavailable.
    pub async fn load(&self) -> usize {
        let stored = match self.storage.get(DATA_KEY_NODES).await {
            Some(JsonValue::Object(map)) => map,
            _ => return 0,
        };

        let mut orphaned: Vec<String> = Vec::new();
        {
            let mut nodes = self.nodes.write();
            for (id_str, value) in &stored {
                let Ok(node_id) = id_str.parse::<u64>() else {
                    orphaned.push(id_str.clone());
                    continue;
                };
                if value.is_null() {
                    // left-over from a failed commissioning attempt
                    orphaned.push(id_str.clone());
                    continue;
                }
                let mut node = match serde_json::from_value::<NodeRecord>(value.clone()) {
                    Ok(node) => node,
                    Err(err) => {
                        warn!(
                            "Stored state for node {node_id} is malformed ({err}), \
                             scheduling re-interview"
                        );
                        NodeRecord::fallback_from_stored(node_id, value)
                    }
                };
                node.node_id = node_id;
                node.available = false;
                nodes.insert(node_id, node);
            }
        }

        for id_str in orphaned {
            debug!("Removing orphaned node entry {id_str} from storage");
            if let Err(err) = self.storage.remove_subkey(DATA_KEY_NODES, &id_str).await {
                warn!("Failed to remove orphaned node entry {id_str}: {err}");
            }
        }

        self.nodes.read().len()
    }

    pub fn get(&self, node_id: u64) -> Option<NodeRecord> {
        self.nodes.read().get(&node_id).cloned()
    }

    pub fn contains(&self, node_id: u64) -> bool {
        self.nodes.read().contains_key(&node_id)
    }

    pub fn list(&self, only_available: bool) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self
            .nodes
            .read()
            .values()
            .filter(|node| node.available || !only_available)
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.node_id);
        nodes
    }

    pub fn highest_node_id(&self) -> Option<u64> {
        self.nodes.read().keys().max().copied()
    }

    /// Insert or replace a record. Returns true when the node was new.
    pub fn upsert(&self, node: NodeRecord) -> bool {
        self.nodes.write().insert(node.node_id, node).is_none()
    }

    /// Remove a record from the registry, returning it.
    pub fn take(&self, node_id: u64) -> Option<NodeRecord> {
        self.nodes.write().remove(&node_id)
    }

    /// Mutate a record in place under the registry lock.
    pub fn update<R>(&self, node_id: u64, mutate: impl FnOnce(&mut NodeRecord) -> R) -> Option<R> {
        self.nodes.write().get_mut(&node_id).map(mutate)
    }

    /// Cached attribute value for one node.
    pub fn attribute(&self, node_id: u64, path: &str) -> Option<AttributeValue> {
        self.nodes
            .read()
            .get(&node_id)
            .and_then(|node| node.attributes.get(path))
            .cloned()
    }

    /// Mirror the current record to storage. Synthetic test nodes stay
    /// in-memory only.
    pub async fn schedule_write(&self, node_id: u64, force: bool) {
        let Some(node) = self.get(node_id) else {
            return;
        };
        if node.is_test_node() {
            return;
        }
        let serialized = match serde_json::to_value(&node) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to serialize node {node_id}: {err}");
                return;
            }
        };
        if let Err(err) = self
            .storage
            .set_subkey(DATA_KEY_NODES, &node_id.to_string(), serialized, force)
            .await
        {
            warn!("Failed to persist node {node_id}: {err}");
        }
    }

    pub async fn remove_persisted(&self, node_id: u64) {
        if let Err(err) = self
            .storage
            .remove_subkey(DATA_KEY_NODES, &node_id.to_string())
            .await
        {
            warn!("Failed to remove node {node_id} from storage: {err}");
        }
    }
}

/// Monotone node-id generator persisted across restarts.
///
/// Allocated ids are never recycled, even when commissioning fails.
pub(crate) struct IdAllocator {
    storage: Arc<dyn Storage>,
}

impl IdAllocator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Reserve and persist the next node id. The synthetic test-node range
    /// starting at [`TEST_NODE_START`] is never handed out.
    pub async fn next_id(&self) -> Result<u64> {
        let last = self
            .storage
            .get(DATA_KEY_LAST_NODE_ID)
            .await
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        let next = last + 1;
        if next >= TEST_NODE_START {
            return Err(ControllerError::InvalidArguments(
                "node id space exhausted".to_string(),
            ));
        }
        self.storage
            .set(DATA_KEY_LAST_NODE_ID, JsonValue::from(next), true)
            .await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    async fn storage_with_nodes(nodes: JsonValue) -> Arc<dyn Storage> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage
            .set(DATA_KEY_NODES, nodes, true)
            .await
            .expect("seed storage");
        storage
    }

    #[tokio::test]
    async fn test_load_marks_nodes_unavailable() {
        let storage = storage_with_nodes(json!({
            "1": {
                "node_id": 1,
                "date_commissioned": "2024-01-01T00:00:00Z",
                "last_interview": "2024-01-01T00:00:00Z",
                "interview_version": 11,
                "available": true,
                "attributes": {"0/40/9": 10},
            },
        })).await;
        let store = NodeStore::new(storage);
        assert_eq!(store.load().await, 1);
        let node = store.get(1).expect("node");
        assert!(!node.available);
        assert_eq!(
            node.attributes.get("0/40/9"),
            Some(&AttributeValue::UInt(10))
        );
    }

    #[tokio::test]
    async fn test_load_degrades_malformed_entry() {
        let storage = storage_with_nodes(json!({
            "2": {
                "date_commissioned": "2024-02-02T00:00:00Z",
                "last_interview": "not a timestamp",
            },
        })).await;
        let store = NodeStore::new(storage);
        assert_eq!(store.load().await, 1);
        let node = store.get(2).expect("node");
        assert_eq!(node.interview_version, 0);
        assert_eq!(
            node.date_commissioned,
            chrono::DateTime::parse_from_rfc3339("2024-02-02T00:00:00Z").expect("ts")
        );
    }

    #[tokio::test]
    async fn test_load_purges_orphaned_entries() {
        let storage = storage_with_nodes(json!({ "3": null })).await;
        let store = NodeStore::new(Arc::clone(&storage));
        assert_eq!(store.load().await, 0);
        assert_eq!(storage.get(DATA_KEY_NODES).await, Some(json!({})));
    }

    #[tokio::test]
    async fn test_schedule_write_skips_test_nodes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let store = NodeStore::new(Arc::clone(&storage));
        store.upsert(NodeRecord::fallback_from_stored(
            TEST_NODE_START + 1,
            &json!({}),
        ));
        store.schedule_write(TEST_NODE_START + 1, true).await;
        assert_eq!(storage.get(DATA_KEY_NODES).await, None);
    }

    #[tokio::test]
    async fn test_id_allocator_is_monotone_across_restart() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        let allocator = IdAllocator::new(Arc::clone(&storage));
        assert_eq!(allocator.next_id().await.expect("id"), 1);
        assert_eq!(allocator.next_id().await.expect("id"), 2);

        // a fresh allocator over the same storage continues the sequence
        let restarted = IdAllocator::new(Arc::clone(&storage));
        assert_eq!(restarted.next_id().await.expect("id"), 3);
    }
}
