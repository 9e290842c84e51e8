//! Persistent key-value storage for controller state.
//!
//! The controller is the single writer; write coalescing lives here so hot
//! paths (attribute updates) can schedule saves without touching the disk on
//! every change. `force` bypasses coalescing for critical moments such as a
//! fresh interview.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error as ThisError;

use crate::debounce::Debouncer;

/// Delay before a scheduled (non-forced) save hits the disk.
const DEFAULT_SAVE_DELAY: Duration = Duration::from_secs(120);

const SAVE_TIMER_KEY: &str = "storage/save";

#[derive(ThisError, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Storage collaborator interface.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn start(&self) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Option<JsonValue>;

    async fn set(&self, key: &str, value: JsonValue, force: bool) -> Result<(), StorageError>;

    /// Set one entry of the object stored under `key`.
    async fn set_subkey(
        &self,
        key: &str,
        subkey: &str,
        value: JsonValue,
        force: bool,
    ) -> Result<(), StorageError>;

    async fn remove_subkey(&self, key: &str, subkey: &str) -> Result<(), StorageError>;

    /// Flush pending writes and release resources.
    async fn stop(&self) -> Result<(), StorageError>;
}

/// JSON-file backed storage with coalesced saves and atomic replace.
pub struct JsonFileStorage {
    path: PathBuf,
    data: Arc<RwLock<Map<String, JsonValue>>>,
    debouncer: Debouncer,
}

impl JsonFileStorage {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            data: Arc::new(RwLock::new(Map::new())),
            debouncer: Debouncer::new(),
        }
    }

    async fn save(&self, force: bool) -> Result<(), StorageError> {
        if force {
            self.debouncer.cancel(SAVE_TIMER_KEY);
            return save_to_disk(self.path.clone(), Arc::clone(&self.data)).await;
        }
        let path = self.path.clone();
        let data = Arc::clone(&self.data);
        self.debouncer
            .schedule(SAVE_TIMER_KEY, DEFAULT_SAVE_DELAY, move || async move {
                if let Err(err) = save_to_disk(path, data).await {
                    error!("Scheduled storage save failed: {err}");
                }
            });
        Ok(())
    }
}

async fn save_to_disk(
    path: PathBuf,
    data: Arc<RwLock<Map<String, JsonValue>>>,
) -> Result<(), StorageError> {
    let serialized = serde_json::to_vec_pretty(&*data.read())?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, serialized).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    debug!("Saved storage to {}", path.display());
    Ok(())
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn start(&self) -> Result<(), StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => match serde_json::from_slice::<Map<String, JsonValue>>(&raw) {
                Ok(loaded) => {
                    info!(
                        "Loaded persistent storage from {} ({} keys)",
                        self.path.display(),
                        loaded.len()
                    );
                    *self.data.write() = loaded;
                }
                Err(err) => {
                    warn!(
                        "Persistent storage at {} is corrupt ({err}), starting empty",
                        self.path.display()
                    );
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No persistent storage found at {}, starting fresh",
                    self.path.display()
                );
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<JsonValue> {
        self.data.read().get(key).cloned()
    }

    async fn set(&self, key: &str, value: JsonValue, force: bool) -> Result<(), StorageError> {
        self.data.write().insert(key.to_string(), value);
        self.save(force).await
    }

    async fn set_subkey(
        &self,
        key: &str,
        subkey: &str,
        value: JsonValue,
        force: bool,
    ) -> Result<(), StorageError> {
        {
            let mut data = self.data.write();
            let entry = data
                .entry(key.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if !entry.is_object() {
                *entry = JsonValue::Object(Map::new());
            }
            if let Some(object) = entry.as_object_mut() {
                object.insert(subkey.to_string(), value);
            }
        }
        self.save(force).await
    }

    async fn remove_subkey(&self, key: &str, subkey: &str) -> Result<(), StorageError> {
        {
            let mut data = self.data.write();
            if let Some(object) = data.get_mut(key).and_then(JsonValue::as_object_mut) {
                object.remove(subkey);
            }
        }
        self.save(false).await
    }

    async fn stop(&self) -> Result<(), StorageError> {
        self.debouncer.cancel(SAVE_TIMER_KEY);
        save_to_disk(self.path.clone(), Arc::clone(&self.data)).await
    }
}

/// In-memory storage for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStorage {
    data: RwLock<Map<String, JsonValue>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn start(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<JsonValue> {
        self.data.read().get(key).cloned()
    }

    async fn set(&self, key: &str, value: JsonValue, _force: bool) -> Result<(), StorageError> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn set_subkey(
        &self,
        key: &str,
        subkey: &str,
        value: JsonValue,
        _force: bool,
    ) -> Result<(), StorageError> {
        let mut data = self.data.write();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if let Some(object) = entry.as_object_mut() {
            object.insert(subkey.to_string(), value);
        }
        Ok(())
    }

    async fn remove_subkey(&self, key: &str, subkey: &str) -> Result<(), StorageError> {
        let mut data = self.data.write();
        if let Some(object) = data.get_mut(key).and_then(JsonValue::as_object_mut) {
            object.remove(subkey);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_storage_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("matter-controller-{}-{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_file_storage_roundtrip() {
        let path = temp_storage_path("roundtrip");
        let _ = tokio::fs::remove_file(&path).await;

        let storage = JsonFileStorage::new(path.clone());
        storage.start().await.expect("start");
        storage
            .set("last_node_id", json!(7), true)
            .await
            .expect("set");
        storage
            .set_subkey("nodes", "7", json!({"node_id": 7}), true)
            .await
            .expect("set_subkey");
        storage.stop().await.expect("stop");

        let reopened = JsonFileStorage::new(path.clone());
        reopened.start().await.expect("restart");
        assert_eq!(reopened.get("last_node_id").await, Some(json!(7)));
        assert_eq!(
            reopened.get("nodes").await,
            Some(json!({"7": {"node_id": 7}}))
        );

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_file_storage_corrupt_file_starts_empty() {
        let path = temp_storage_path("corrupt");
        tokio::fs::write(&path, b"{not json").await.expect("write");

        let storage = JsonFileStorage::new(path.clone());
        storage.start().await.expect("start");
        assert_eq!(storage.get("nodes").await, None);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_memory_storage_subkeys() {
        let storage = MemoryStorage::new();
        storage
            .set_subkey("nodes", "1", json!({"a": 1}), false)
            .await
            .expect("set");
        storage
            .set_subkey("nodes", "2", json!({"a": 2}), false)
            .await
            .expect("set");
        storage.remove_subkey("nodes", "1").await.expect("remove");
        assert_eq!(storage.get("nodes").await, Some(json!({"2": {"a": 2}})));
    }
}
