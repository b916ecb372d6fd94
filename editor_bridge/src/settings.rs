//! Storage settings for the editor state.
//!
//! The state directory comes from `DTC_EDITOR_STATE_DIR`, falling back to
//! `$HOME/.dtc-editor`.

use std::path::PathBuf;

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "DTC_EDITOR_STATE_DIR";

/// Fixed key the configuration blob is stored under.
pub const DEFAULT_STORAGE_KEY: &str = "dtc-editor-config";

/// Imports larger than this are refused before parsing.
pub const DEFAULT_MAX_IMPORT_BYTES: u64 = 5 * 1024 * 1024;

/// Configuration for persisted editor state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory holding the state file
    pub state_dir: PathBuf,
    /// Storage key; also the state file stem
    pub storage_key: String,
    /// Upper bound on imported file size
    pub max_import_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: resolve_state_dir(std::env::var(STATE_DIR_ENV).ok(), std::env::var("HOME").ok()),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            max_import_bytes: DEFAULT_MAX_IMPORT_BYTES,
        }
    }
}

impl StorageConfig {
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn with_max_import_bytes(mut self, limit: u64) -> Self {
        self.max_import_bytes = limit;
        self
    }

    /// Path of the state file, `<state_dir>/<storage_key>.json`.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.storage_key))
    }
}

fn resolve_state_dir(explicit: Option<String>, home: Option<String>) -> PathBuf {
    match explicit.filter(|d| !d.trim().is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => {
            let home = home.unwrap_or_else(|| ".".to_string());
            PathBuf::from(home).join(".dtc-editor")
        }
    }
}
