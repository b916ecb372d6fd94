//! Persisted editor state.
//!
//! The current configuration is stored as a JSON envelope under a fixed key:
//!
//! ```json
//! { "storageKey": "...", "savedAt": "RFC 3339", "digest": "sha256 hex", "config": { ... } }
//! ```
//!
//! Loading verifies the digest. Anything unreadable falls back to the default
//! configuration so the editor always starts.

use std::cell::{Cell, RefCell};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use config_engine::{Config, ConfigSink, PersistError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::settings::StorageConfig;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode state: {0}")]
    Encode(String),

    #[error("Failed to decode state: {0}")]
    Decode(String),

    #[error("State was saved under key '{found}', expected '{expected}'")]
    KeyMismatch { expected: String, found: String },

    #[error("State digest mismatch: stored {stored}, computed {computed}")]
    DigestMismatch { stored: String, computed: String },
}

impl From<PersistenceError> for PersistError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::Encode(msg) => PersistError::Serialization(msg),
            other => PersistError::Write(other.to_string()),
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    storage_key: &'a str,
    saved_at: DateTime<Utc>,
    digest: String,
    config: &'a Config,
}

// Read side keeps `config` raw so the digest is checked before decoding.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEnvelope {
    storage_key: String,
    #[allow(dead_code)]
    saved_at: DateTime<Utc>,
    digest: String,
    config: Value,
}

/// SHA-256 of the compact JSON form of a value.
fn digest_of(value: &Value) -> Result<String, PersistenceError> {
    let json = serde_json::to_string(value).map_err(|e| PersistenceError::Encode(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest of a configuration as it would be stored.
pub fn config_digest(config: &Config) -> Result<String, PersistenceError> {
    let value = serde_json::to_value(config).map_err(|e| PersistenceError::Encode(e.to_string()))?;
    digest_of(&value)
}

/// Encodes a config into an envelope. Returns the text and its digest.
fn encode_state(storage_key: &str, config: &Config) -> Result<(String, String), PersistenceError> {
    let digest = config_digest(config)?;
    let envelope = Envelope {
        storage_key,
        saved_at: Utc::now(),
        digest: digest.clone(),
        config,
    };
    let text = serde_json::to_string_pretty(&envelope).map_err(|e| PersistenceError::Encode(e.to_string()))?;
    Ok((text, digest))
}

/// Decodes and verifies an envelope. Returns the config and its digest.
fn decode_state(storage_key: &str, text: &str) -> Result<(Config, String), PersistenceError> {
    let stored: StoredEnvelope =
        serde_json::from_str(text).map_err(|e| PersistenceError::Decode(e.to_string()))?;

    if stored.storage_key != storage_key {
        return Err(PersistenceError::KeyMismatch {
            expected: storage_key.to_string(),
            found: stored.storage_key,
        });
    }

    let computed = digest_of(&stored.config)?;
    if computed != stored.digest {
        return Err(PersistenceError::DigestMismatch {
            stored: stored.digest,
            computed,
        });
    }

    let config: Config =
        serde_json::from_value(stored.config).map_err(|e| PersistenceError::Decode(e.to_string()))?;
    Ok((config, computed))
}

// ============================================================================
// FILE STORE
// ============================================================================

/// State file under the configured directory. Writes go through a temp file
/// and a rename, and are skipped when the content did not change.
#[derive(Debug)]
pub struct FileStateStore {
    settings: StorageConfig,
    last_digest: Option<String>,
}

impl FileStateStore {
    pub fn new(settings: StorageConfig) -> Self {
        Self {
            settings,
            last_digest: None,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.settings.state_file()
    }

    /// Reads the stored config, if any.
    pub fn try_load(&mut self) -> Result<Option<Config>, PersistenceError> {
        let path = self.path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        let (config, digest) = decode_state(&self.settings.storage_key, &text)?;
        self.last_digest = Some(digest);
        Ok(Some(config))
    }

    /// Reads the stored config, falling back to the default configuration.
    pub fn load(&mut self) -> Config {
        match self.try_load() {
            Ok(Some(config)) => {
                info!(
                    "Loaded editor state from {} ({} entries)",
                    self.path().display(),
                    config.entry_count()
                );
                config
            }
            Ok(None) => {
                info!("No editor state at {}, starting from defaults", self.path().display());
                Config::default()
            }
            Err(e) => {
                warn!("Discarding editor state at {}: {}", self.path().display(), e);
                Config::default()
            }
        }
    }

    /// Writes the config. Returns false when the stored state was already
    /// identical.
    pub fn save(&mut self, config: &Config) -> Result<bool, PersistenceError> {
        let digest = config_digest(config)?;
        if self.last_digest.as_deref() == Some(digest.as_str()) {
            debug!("Editor state unchanged, skipping write");
            return Ok(false);
        }

        let (text, digest) = encode_state(&self.settings.storage_key, config)?;
        let path = self.path();
        write_atomically(&path, &text)?;
        self.last_digest = Some(digest);
        debug!("Saved editor state to {}", path.display());
        Ok(true)
    }

    /// Removes the state file.
    pub fn clear(&mut self) -> Result<(), PersistenceError> {
        let path = self.path();
        self.last_digest = None;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }
}

impl ConfigSink for FileStateStore {
    fn persist(&mut self, config: &Config) -> Result<(), PersistError> {
        self.save(config).map(|_| ()).map_err(PersistError::from)
    }
}

fn write_atomically(path: &Path, text: &str) -> Result<(), PersistenceError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| PersistenceError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let temp = path.with_extension("json.tmp");
    fs::write(&temp, text).map_err(|source| PersistenceError::Io {
        path: temp.clone(),
        source,
    })?;
    fs::rename(&temp, path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// In-memory stand-in for the state file. Clones share the same slot.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    storage_key: String,
    slot: Rc<RefCell<Option<String>>>,
    writes: Rc<Cell<usize>>,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(crate::settings::DEFAULT_STORAGE_KEY)
    }
}

impl MemoryStateStore {
    pub fn new(storage_key: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            slot: Rc::new(RefCell::new(None)),
            writes: Rc::new(Cell::new(0)),
        }
    }

    /// Seeds the slot with raw stored text.
    pub fn with_stored(self, text: impl Into<String>) -> Self {
        *self.slot.borrow_mut() = Some(text.into());
        self
    }

    pub fn stored(&self) -> Option<String> {
        self.slot.borrow().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.get()
    }

    pub fn load(&self) -> Config {
        let Some(text) = self.stored() else {
            return Config::default();
        };
        match decode_state(&self.storage_key, &text) {
            Ok((config, _)) => config,
            Err(e) => {
                warn!("Discarding stored editor state: {}", e);
                Config::default()
            }
        }
    }
}

impl ConfigSink for MemoryStateStore {
    fn persist(&mut self, config: &Config) -> Result<(), PersistError> {
        let (text, _) = encode_state(&self.storage_key, config)?;
        *self.slot.borrow_mut() = Some(text);
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_engine::{EntryPayload, FlatEntry, RoundingStrategy, Section, SectionType};
    use tempfile::TempDir;

    fn sample_config() -> Config {
        Config {
            variant: "treatment".to_string(),
            platform: "android".to_string(),
            country_code: "CA".to_string(),
            sections: vec![Section::with_entries(
                SectionType::Rounding,
                vec![FlatEntry::new(EntryPayload::Rounding {
                    strategy: RoundingStrategy::Floor,
                })],
            )],
            ..Config::default()
        }
    }

    fn store_in(dir: &TempDir) -> FileStateStore {
        FileStateStore::new(StorageConfig::default().with_state_dir(dir.path()))
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        assert!(store.save(&sample_config()).unwrap());

        let mut reopened = store_in(&dir);
        assert_eq!(reopened.load(), sample_config());
        assert!(!dir.path().join("dtc-editor-config.json.tmp").exists());
    }

    #[test]
    fn test_envelope_shape() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.save(&sample_config()).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["storageKey"], "dtc-editor-config");
        assert_eq!(value["config"]["variant"], "treatment");
        assert_eq!(value["digest"], config_digest(&sample_config()).unwrap());
        assert!(DateTime::parse_from_rfc3339(value["savedAt"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_unchanged_config_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        assert!(store.save(&sample_config()).unwrap());
        assert!(!store.save(&sample_config()).unwrap());

        let mut changed = sample_config();
        changed.variant = "control".to_string();
        assert!(store.save(&changed).unwrap());
    }

    #[test]
    fn test_missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        assert_eq!(store.try_load().unwrap(), None);
        assert_eq!(store.load(), Config::default());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        fs::write(store.path(), "{ not json").unwrap();

        assert!(matches!(store.try_load(), Err(PersistenceError::Decode(_))));
        assert_eq!(store.load(), Config::default());
    }

    #[test]
    fn test_tampered_config_fails_digest() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.save(&sample_config()).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), text.replace("treatment", "tampered")).unwrap();

        let mut reopened = store_in(&dir);
        assert!(matches!(reopened.try_load(), Err(PersistenceError::DigestMismatch { .. })));
        assert_eq!(reopened.load(), Config::default());
    }

    #[test]
    fn test_foreign_storage_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.save(&sample_config()).unwrap();

        // Same file, different expected key.
        let text = fs::read_to_string(store.path()).unwrap();
        let err = decode_state("other-key", &text).unwrap_err();
        assert!(matches!(err, PersistenceError::KeyMismatch { .. }));
    }

    #[test]
    fn test_clear_removes_state() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.save(&sample_config()).unwrap();
        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_memory_store_shares_slot() {
        let store = MemoryStateStore::default();
        let mut sink = store.clone();
        sink.persist(&sample_config()).unwrap();

        assert_eq!(store.write_count(), 1);
        assert_eq!(store.load(), sample_config());

        let corrupt = MemoryStateStore::default().with_stored("garbage");
        assert_eq!(corrupt.load(), Config::default());
    }
}
