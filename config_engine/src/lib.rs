pub mod conditions;
pub mod config_model;
pub mod rule_store;
pub mod overlap_validator;
pub mod serialization;
pub mod import_reconciler;

pub use conditions::{
    common_params, derive_title, describe_range, grouping_key, grouping_params,
    normalize_conditions, Bounds, ConditionError, ConditionSet, DeliveryMode, Interval,
};

pub use config_model::{
    Config, DisplayFormat, EntryError, EntryPayload, FlatEntry, MetadataField, RangeCap,
    RoundingStrategy, Section, SectionType, SingleCap,
};

pub use rule_store::{
    CappingField,           // Editable capping payload fields
    CappingKind,            // Capping variant tag
    CappingRule,            // Capping payload (tagged union)
    ConfigSink,             // Write-through persistence seam
    Group,                  // Rules sharing common parameters
    GroupId,                // Group identifier
    GroupIndex,             // Ordered group collection
    PersistError,           // Sink errors
    Rule,                   // One rule inside a group
    RuleBody,               // Section-specific rule content
    RuleId,                 // Rule identifier
    RuleStore,              // Model owner and mutators
    RuleUpdate,             // Rule field edits
};

pub use overlap_validator::{
    DuplicateGroupIssue,    // Duplicate group findings
    OverlapIssue,           // Overlapping rule findings
    OverlapValidator,       // Read-only group validator
    RequiredFieldIssue,     // Missing or inverted values
    RuleRef,                // Rule location for highlighting
    ValidationReport,       // Validation outcome
};

pub use serialization::{
    DocumentKind,           // YAML or JSON
    EntrySpan,              // Line span of an emitted entry
    ParseError,             // Parse errors
    RenderedDocument,       // Generated text with spans
    SerializationEngine,    // Text/JSON emission and parsing
};

pub use import_reconciler::{
    AnnotatedLine,          // Diff line with match status
    ImportDiff,             // Side-by-side annotated diff
    ImportError,            // Import errors
    ImportIssue,            // Blocking import problems
    ImportPlan,             // Reviewed import, ready to commit
    ImportReconciler,       // Validation, normalization, merge, diff
    ImportValidation,       // Validation gate outcome
    ImportWarning,          // Recoverable import problems
    LineStatus,             // Diff line classification
};
