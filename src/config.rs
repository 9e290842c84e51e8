use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Location of the JSON node-state file.
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            storage: StorageConfig {
                path: base.join("matter-controller").join("nodes.json"),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("MATTER_STORAGE_PATH") {
            config.storage.path = PathBuf::from(path);
        }

        config
    }
}
