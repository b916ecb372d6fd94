//! Editing session.
//!
//! An `EditorSession` is the single writer of the model. Every edit goes
//! through the owned `RuleStore`, which writes through to the attached state
//! store. Read access to the store is shared; mutation only happens through
//! the methods below.
//!
//! Imports are two-phase: `prepare_import` builds a reviewable plan without
//! touching the model and `commit_import` installs it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use config_engine::{
    Bounds, Config, ConfigSink, DocumentKind, GroupId, ImportError, ImportPlan, ImportReconciler,
    MetadataField, OverlapValidator, RenderedDocument, RuleBody, RuleId, RuleStore, RuleUpdate,
    SectionType, SerializationEngine, ValidationReport,
};
use log::{info, warn};
use thiserror::Error;

use crate::files::{self, ExportArtifact, FileError};
use crate::settings::StorageConfig;
use crate::storage::FileStateStore;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Import(#[from] ImportError),
}

#[derive(Debug)]
pub struct EditorSession {
    store: RuleStore,
    validator: OverlapValidator,
    max_import_bytes: u64,
}

impl EditorSession {
    /// Session without persistence.
    pub fn new(config: Config) -> Self {
        Self::from_store(RuleStore::new(config), crate::settings::DEFAULT_MAX_IMPORT_BYTES)
    }

    /// Session persisting through `sink`. The initial config is not written.
    pub fn with_sink(config: Config, sink: Box<dyn ConfigSink>) -> Self {
        Self::from_store(
            RuleStore::new(config).with_sink(sink),
            crate::settings::DEFAULT_MAX_IMPORT_BYTES,
        )
    }

    /// Restores the persisted state (or the default config) and keeps
    /// writing through to the same state file.
    pub fn open(settings: StorageConfig) -> Self {
        let max_import_bytes = settings.max_import_bytes;
        let mut state = FileStateStore::new(settings);
        let config = state.load();
        info!("Opened editor session on {}", state.path().display());
        Self::from_store(RuleStore::new(config).with_sink(Box::new(state)), max_import_bytes)
    }

    fn from_store(store: RuleStore, max_import_bytes: u64) -> Self {
        Self {
            store,
            validator: OverlapValidator::new(),
            max_import_bytes,
        }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        self.store.config()
    }

    /// Current validation findings over all groups.
    pub fn issues(&self) -> ValidationReport {
        self.validator.validate(self.store.groups().as_slice())
    }

    /// Textual preview of the current model.
    pub fn preview(&self) -> String {
        SerializationEngine::generate(self.store.config())
    }

    /// Preview with entry line spans, for highlighting.
    pub fn preview_document(&self) -> RenderedDocument {
        SerializationEngine::render(self.store.config())
    }

    // ========================================================================
    // EDITING
    // ========================================================================

    pub fn set_metadata(&mut self, field: MetadataField, value: impl Into<String>) {
        self.store.set_metadata(field, value);
    }

    pub fn add_group(
        &mut self,
        section: SectionType,
        common_params: BTreeMap<String, String>,
        title: Option<String>,
    ) -> GroupId {
        self.store.add_group(section, common_params, title)
    }

    pub fn clone_group(&mut self, id: GroupId) -> Option<GroupId> {
        self.store.clone_group(id)
    }

    pub fn delete_group(&mut self, id: GroupId) -> bool {
        self.store.delete_group(id)
    }

    pub fn update_group_common_param(&mut self, id: GroupId, key: &str, value: Option<&str>) -> bool {
        self.store.update_group_common_param(id, key, value)
    }

    pub fn rename_group(&mut self, id: GroupId, title: Option<String>) -> bool {
        self.store.rename_group(id, title)
    }

    pub fn add_rule(&mut self, group_id: GroupId) -> Option<RuleId> {
        self.store.add_rule(group_id)
    }

    pub fn insert_rule(&mut self, group_id: GroupId, body: RuleBody, bounds: Bounds) -> Option<RuleId> {
        self.store.insert_rule(group_id, body, bounds)
    }

    pub fn update_rule(&mut self, group_id: GroupId, rule_id: RuleId, update: RuleUpdate) -> bool {
        self.store.update_rule(group_id, rule_id, update)
    }

    pub fn delete_rule(&mut self, group_id: GroupId, rule_id: RuleId) -> bool {
        self.store.delete_rule(group_id, rule_id)
    }

    // ========================================================================
    // IMPORT
    // ========================================================================

    /// Builds an import plan. The model is untouched whatever the outcome.
    pub fn prepare_import(&self, text: &str, kind: DocumentKind) -> Result<ImportPlan, ImportError> {
        match ImportReconciler::prepare(text, kind) {
            Ok(plan) => Ok(plan),
            Err(e) => {
                warn!("Import rejected: {}", e);
                Err(e)
            }
        }
    }

    pub fn prepare_import_file(&self, path: &Path) -> Result<ImportPlan, SessionError> {
        let source = files::import_file_with_limit(path, self.max_import_bytes)?;
        Ok(self.prepare_import(&source.text, source.kind)?)
    }

    /// Installs a reviewed plan. Group and rule ids are fresh afterwards.
    pub fn commit_import(&mut self, plan: ImportPlan) {
        let warnings = plan.warnings.len();
        self.store.replace_config(plan.merged);
        info!(
            "Committed import: {} groups, {} warnings",
            self.store.groups().len(),
            warnings
        );
    }

    // ========================================================================
    // EXPORT
    // ========================================================================

    pub fn export(&self, kind: DocumentKind) -> Result<ExportArtifact, FileError> {
        files::export(self.store.config(), kind)
    }

    /// Exports into `dir`, returning the written path.
    pub fn export_to(&self, dir: &Path, kind: DocumentKind) -> Result<PathBuf, FileError> {
        let artifact = self.export(kind)?;
        files::write_artifact(dir, &artifact)
    }
}
