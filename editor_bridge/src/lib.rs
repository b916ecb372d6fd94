//! Editor bridge for the delivery-time config engine.
//!
//! Wires the engine to the outside world:
//! - `settings`: where editor state lives
//! - `storage`: persisted state with an integrity digest
//! - `files`: import from and export to YAML/JSON files
//! - `session`: the single-writer editing session

pub mod files;
pub mod session;
pub mod settings;
pub mod storage;

pub use files::{export, import_file, ExportArtifact, FileError, ImportSource};
pub use session::{EditorSession, SessionError};
pub use settings::StorageConfig;
pub use storage::{FileStateStore, MemoryStateStore, PersistenceError};
