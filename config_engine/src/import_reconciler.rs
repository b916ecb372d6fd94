// Import of externally produced documents.
//
// This module provides:
// 1. A validation gate with a user-facing error and warning list
// 2. Lenient normalization into a Config (metadata defaults, condition
//    coercion)
// 3. Merging of redundant flat entries by common parameters, with the same
//    grouping policy the rule store uses
// 4. An entry-wise diff between the imported document and what would be
//    committed, for human review
//
// Nothing here touches the current model; committing a plan is the caller's
// decision.

use log::{debug, info};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::conditions::{common_params, derive_title, grouping_key, grouping_params, Bounds};
use crate::config_model::{Config, FlatEntry, MetadataField, Section, SectionType};
use crate::rule_store::{rebuild_from_config, to_config, IdCounter};
use crate::serialization::{DocumentKind, ParseError, RenderedDocument, SerializationEngine};

/// Problems that block an import
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ImportIssue {
    #[error("Document root must be a mapping")]
    NotAMapping,

    #[error("'sections' (pdt) must be a list, found {found}")]
    SectionsNotAList { found: String },

    #[error("No recognizable section (expected one of display_format, ranges, capping, rounding)")]
    NoRecognizableSection,

    #[error("Section #{index}: {reason}")]
    InvalidSection { index: usize, reason: String },

    #[error("{section} entry #{index}: {reason}")]
    InvalidEntry {
        section: SectionType,
        index: usize,
        reason: String,
    },
}

/// Recoverable problems; the import proceeds with defaults
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ImportWarning {
    #[error("Missing metadata field '{field}', using default \"{default}\"")]
    MissingMetadata { field: &'static str, default: &'static str },

    #[error("Metadata field '{field}' is not a scalar, using default \"{default}\"")]
    InvalidMetadata { field: &'static str, default: &'static str },

    #[error("Section #{index} has unknown key '{key}' and is ignored")]
    UnknownSection { index: usize, key: String },
}

/// Import validation outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportValidation {
    pub valid: bool,
    pub errors: Vec<ImportIssue>,
    pub warnings: Vec<ImportWarning>,
}

impl ImportValidation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: ImportIssue) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ImportWarning) {
        self.warnings.push(warning);
    }
}

/// Import errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ImportError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Import rejected: {}", join_issues(.0))]
    Invalid(Vec<ImportIssue>),
}

fn join_issues(issues: &[ImportIssue]) -> String {
    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Diff classification of one rendered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LineStatus {
    /// Header, section item or comment line.
    Context,
    /// Part of an entry with a logically equal counterpart on the other side.
    Matched,
    /// Part of an entry without a counterpart.
    Unmatched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedLine {
    /// One-based line number.
    pub number: usize,
    pub text: String,
    pub status: LineStatus,
}

/// Side-by-side annotated renderings of the imported and the merged form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDiff {
    pub original_annotated: Vec<AnnotatedLine>,
    pub merged_annotated: Vec<AnnotatedLine>,
}

impl ImportDiff {
    pub fn unmatched_lines(&self) -> usize {
        self.original_annotated
            .iter()
            .chain(self.merged_annotated.iter())
            .filter(|l| l.status == LineStatus::Unmatched)
            .count()
    }

    pub fn has_changes(&self) -> bool {
        self.unmatched_lines() > 0
    }
}

/// Everything a reviewer needs before confirming an import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportPlan {
    pub warnings: Vec<ImportWarning>,
    /// The document as imported, normalized but not merged.
    pub original: Config,
    /// What committing the plan installs.
    pub merged: Config,
    pub diff: ImportDiff,
}

/// Import reconciler
pub struct ImportReconciler;

impl ImportReconciler {
    /// Validation gate over a parsed document.
    pub fn validate(raw: &Value) -> ImportValidation {
        let mut result = ImportValidation::valid();
        let Value::Object(map) = raw else {
            result.add_error(ImportIssue::NotAMapping);
            return result;
        };

        // 1. Metadata
        for field in MetadataField::ALL {
            let (_, warning) = metadata_value(map, field);
            if let Some(warning) = warning {
                result.add_warning(warning);
            }
        }

        // 2. Sections
        let scan = scan_sections(map.get("sections"));
        for warning in scan.warnings {
            result.add_warning(warning);
        }
        for issue in scan.issues {
            result.add_error(issue);
        }
        if result.valid && scan.known_sections == 0 {
            result.add_error(ImportIssue::NoRecognizableSection);
        }

        result
    }

    /// Builds a Config from a parsed document. Missing metadata takes its
    /// default and a missing or non-list `sections` becomes empty. Invalid
    /// entries fail the whole normalization.
    pub fn normalize(raw: &Value) -> Result<Config, ImportError> {
        let Value::Object(map) = raw else {
            return Err(ImportError::Invalid(vec![ImportIssue::NotAMapping]));
        };

        let mut config = Config::default();
        for field in MetadataField::ALL {
            let (value, _) = metadata_value(map, field);
            field.set(&mut config, value);
        }

        let scan = match map.get("sections") {
            Some(Value::Array(_)) => scan_sections(map.get("sections")),
            _ => SectionScan::default(),
        };
        if !scan.issues.is_empty() {
            return Err(ImportError::Invalid(scan.issues));
        }
        config.sections = scan.sections;
        Ok(config)
    }

    /// Re-groups the entries of each section kind by common parameters.
    ///
    /// Returns one section per kind in first-seen order. Within a kind,
    /// entries that share a grouping key (and, for ranges, a PDT pair and a
    /// Mean-Delay pair) become adjacent and share one title: the first
    /// explicit `_title` of the cluster, else a derived one.
    pub fn merge_by_common_params(sections: &[Section]) -> Vec<Section> {
        let mut kinds: Vec<SectionType> = Vec::new();
        for section in sections {
            if !kinds.contains(&section.kind) {
                kinds.push(section.kind);
            }
        }

        let mut merged = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let param_keys = grouping_params(kind);
            let mut clusters: Vec<Vec<&FlatEntry>> = Vec::new();
            let mut by_key: HashMap<String, usize> = HashMap::new();

            for entry in sections.iter().filter(|s| s.kind == kind).flat_map(|s| s.entries.iter()) {
                let key = merge_key(kind, entry, param_keys);
                let index = *by_key.entry(key).or_insert_with(|| {
                    clusters.push(Vec::new());
                    clusters.len() - 1
                });
                clusters[index].push(entry);
            }

            let mut entries = Vec::new();
            for cluster in &clusters {
                let title = cluster_title(kind, cluster, param_keys);
                entries.extend(cluster.iter().map(|e| FlatEntry {
                    title: Some(title.clone()),
                    ..(*e).clone()
                }));
            }
            debug!("Merged {} {} entries into {} clusters", entries.len(), kind, clusters.len());
            merged.push(Section::with_entries(kind, entries));
        }
        merged
    }

    /// Annotated diff between an imported text and a merged config.
    pub fn diff(original_text: &str, kind: DocumentKind, merged: &Config) -> Result<ImportDiff, ImportError> {
        let raw = SerializationEngine::parse(original_text, kind)?;
        let original = Self::normalize(&raw)?;
        Ok(diff_configs(&original, merged))
    }

    /// Parses, validates, normalizes and merges a document. The returned plan
    /// carries the config that committing would install, already passed
    /// through a rule-store rebuild.
    pub fn prepare(text: &str, kind: DocumentKind) -> Result<ImportPlan, ImportError> {
        let raw = SerializationEngine::parse(text, kind)?;
        let validation = Self::validate(&raw);
        if !validation.valid {
            return Err(ImportError::Invalid(validation.errors));
        }

        let original = Self::normalize(&raw)?;
        let mut merged = original.clone();
        merged.sections = Self::merge_by_common_params(&original.sections);
        let index = rebuild_from_config(&merged, &mut IdCounter::new());
        merged.sections = to_config(&index);

        let diff = diff_configs(&original, &merged);
        info!(
            "Prepared {} import: {} entries, {} groups, {} unmatched diff lines",
            kind,
            original.entry_count(),
            index.len(),
            diff.unmatched_lines()
        );

        Ok(ImportPlan {
            warnings: validation.warnings,
            original,
            merged,
            diff,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn metadata_value(map: &Map<String, Value>, field: MetadataField) -> (String, Option<ImportWarning>) {
    let default = field.default_value();
    match map.get(field.canonical_name()) {
        None | Some(Value::Null) => (
            default.to_string(),
            Some(ImportWarning::MissingMetadata {
                field: field.canonical_name(),
                default,
            }),
        ),
        Some(Value::String(s)) => (s.clone(), None),
        Some(value @ (Value::Number(_) | Value::Bool(_))) => (value.to_string(), None),
        Some(_) => (
            default.to_string(),
            Some(ImportWarning::InvalidMetadata {
                field: field.canonical_name(),
                default,
            }),
        ),
    }
}

#[derive(Default)]
struct SectionScan {
    sections: Vec<Section>,
    issues: Vec<ImportIssue>,
    warnings: Vec<ImportWarning>,
    known_sections: usize,
}

fn scan_sections(raw: Option<&Value>) -> SectionScan {
    let mut scan = SectionScan::default();
    let items = match raw {
        None | Some(Value::Null) => return scan,
        Some(Value::Array(items)) => items,
        Some(other) => {
            scan.issues.push(ImportIssue::SectionsNotAList {
                found: value_kind(other).to_string(),
            });
            return scan;
        }
    };

    for (index, item) in items.iter().enumerate() {
        let Value::Object(item) = item else {
            scan.issues.push(ImportIssue::InvalidSection {
                index,
                reason: format!("expected a mapping, found {}", value_kind(item)),
            });
            continue;
        };
        if item.len() != 1 {
            scan.issues.push(ImportIssue::InvalidSection {
                index,
                reason: format!("expected exactly one section key, found {}", item.len()),
            });
            continue;
        }
        let Some((key, raw_entries)) = item.iter().next() else {
            continue;
        };
        let Some(kind) = SectionType::from_wire_key(key) else {
            scan.warnings.push(ImportWarning::UnknownSection {
                index,
                key: key.clone(),
            });
            continue;
        };
        scan.known_sections += 1;

        let raw_entries: &[Value] = match raw_entries {
            Value::Array(entries) => entries,
            Value::Null => &[],
            other => {
                scan.issues.push(ImportIssue::InvalidSection {
                    index,
                    reason: format!("'{}' must be a list, found {}", key, value_kind(other)),
                });
                continue;
            }
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        for (entry_index, raw_entry) in raw_entries.iter().enumerate() {
            match FlatEntry::from_value(kind, raw_entry) {
                Ok(entry) => entries.push(entry),
                Err(e) => scan.issues.push(ImportIssue::InvalidEntry {
                    section: kind,
                    index: entry_index,
                    reason: e.to_string(),
                }),
            }
        }
        scan.sections.push(Section::with_entries(kind, entries));
    }
    scan
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

fn merge_key(kind: SectionType, entry: &FlatEntry, param_keys: &[&str]) -> String {
    let mut key = grouping_key(entry.delivery_option.as_deref(), entry.conditions.as_ref(), param_keys);
    if kind == SectionType::Ranges {
        let bounds = entry.conditions.as_ref().map(|c| c.bounds()).unwrap_or_default();
        key.push_str(&format!(
            "|pdt:{:?}:{:?}|md:{:?}:{:?}",
            bounds.pdt_greater_than,
            bounds.pdt_less_than_or_equal_to,
            bounds.mean_delay_greater_than,
            bounds.mean_delay_less_than_or_equal_to
        ));
    }
    key
}

fn cluster_title(kind: SectionType, cluster: &[&FlatEntry], param_keys: &[&str]) -> String {
    if let Some(title) = cluster
        .iter()
        .filter_map(|e| e.title.as_deref())
        .find(|t| !t.trim().is_empty())
    {
        return title.to_string();
    }
    let Some(first) = cluster.first() else {
        return format!("Default {}", kind.label());
    };
    let params = common_params(first.delivery_option.as_deref(), first.conditions.as_ref(), param_keys);
    let shared = Bounds::shared(
        cluster
            .iter()
            .map(|e| e.conditions.as_ref().map(|c| c.bounds()).unwrap_or_default()),
    );
    derive_title(kind, &params, first.conditions.is_some(), &shared)
}

/// Matches entries of `original` and `merged` per section kind by logical
/// equality, then annotates both renderings.
fn diff_configs(original: &Config, merged: &Config) -> ImportDiff {
    let original_doc = SerializationEngine::render(original);
    let merged_doc = SerializationEngine::render(merged);

    let original_entries = flat_entries(original);
    let merged_entries = flat_entries(merged);
    let mut original_matched = vec![false; original_entries.len()];
    let mut merged_matched = vec![false; merged_entries.len()];

    for (i, (kind, entry)) in original_entries.iter().enumerate() {
        let counterpart = merged_entries
            .iter()
            .enumerate()
            .find(|(j, (k, other))| !merged_matched[*j] && k == kind && entry.logically_eq(other))
            .map(|(j, _)| j);
        if let Some(j) = counterpart {
            original_matched[i] = true;
            merged_matched[j] = true;
        }
    }

    ImportDiff {
        original_annotated: annotate(&original_doc, original, &original_matched),
        merged_annotated: annotate(&merged_doc, merged, &merged_matched),
    }
}

/// Entries in section then entry order, which is also span order.
fn flat_entries(config: &Config) -> Vec<(SectionType, &FlatEntry)> {
    config
        .sections
        .iter()
        .flat_map(|s| s.entries.iter().map(move |e| (s.kind, e)))
        .collect()
}

fn annotate(doc: &RenderedDocument, config: &Config, matched: &[bool]) -> Vec<AnnotatedLine> {
    // Ranges clusters render out of entry order, so spans are mapped back to
    // flat positions through per-section offsets.
    let mut offsets = Vec::with_capacity(config.sections.len());
    let mut total = 0;
    for section in &config.sections {
        offsets.push(total);
        total += section.entries.len();
    }

    let mut status = vec![LineStatus::Context; doc.text.lines().count()];
    for span in &doc.spans {
        let flat_index = offsets.get(span.section_index).copied().unwrap_or(0) + span.entry_index;
        let line_status = if matched.get(flat_index).copied().unwrap_or(false) {
            LineStatus::Matched
        } else {
            LineStatus::Unmatched
        };
        for line in span.lines.clone() {
            if let Some(slot) = status.get_mut(line) {
                *slot = line_status;
            }
        }
    }

    doc.text
        .lines()
        .zip(status)
        .enumerate()
        .map(|(i, (text, status))| AnnotatedLine {
            number: i + 1,
            text: text.to_string(),
            status,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ranges_doc(entries: Value) -> Value {
        json!({
            "formatVersion": "1",
            "variant": "control",
            "platform": "android",
            "countryCode": "DE",
            "sections": [{"ranges": entries}]
        })
    }

    #[test]
    fn test_validate_rejects_missing_and_malformed_sections() {
        let missing = ImportReconciler::validate(&json!({"variant": "x"}));
        assert!(!missing.valid);
        assert_eq!(missing.errors, vec![ImportIssue::NoRecognizableSection]);

        let not_list = ImportReconciler::validate(&json!({"sections": {"ranges": []}}));
        assert_eq!(
            not_list.errors,
            vec![ImportIssue::SectionsNotAList {
                found: "mapping".to_string()
            }]
        );

        let unknown_only = ImportReconciler::validate(&json!({"sections": [{"surcharges": []}]}));
        assert_eq!(unknown_only.errors, vec![ImportIssue::NoRecognizableSection]);
        assert!(unknown_only
            .warnings
            .iter()
            .any(|w| matches!(w, ImportWarning::UnknownSection { key, .. } if key == "surcharges")));
    }

    #[test]
    fn test_validate_warns_on_missing_metadata() {
        let result = ImportReconciler::validate(&json!({"sections": [{"rounding": []}]}));
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 4);
        assert!(result.warnings.contains(&ImportWarning::MissingMetadata {
            field: "formatVersion",
            default: "1"
        }));
    }

    #[test]
    fn test_validate_reports_bad_entries() {
        let result = ImportReconciler::validate(&ranges_doc(json!([{"lower_bound": 1}])));
        assert!(!result.valid);
        assert!(matches!(
            &result.errors[0],
            ImportIssue::InvalidEntry { section: SectionType::Ranges, index: 0, .. }
        ));
    }

    #[test]
    fn test_normalize_fills_defaults_and_coerces() {
        let config = ImportReconciler::normalize(&json!({
            "formatVersion": 2,
            "sections": [{"display_format": [
                {"format": "EXACT", "conditions": {"marketplace": "false", "vertical_types": "groceries"}}
            ]}]
        }))
        .unwrap();

        assert_eq!(config.format_version, "2");
        assert_eq!(config.variant, "default");
        assert_eq!(config.platform, "");
        let conditions = config.sections[0].entries[0].conditions.as_ref().unwrap();
        assert_eq!(conditions.marketplace, Some(false));
        assert_eq!(conditions.vertical_types, Some(vec!["groceries".to_string()]));
    }

    #[test]
    fn test_normalize_coerces_non_list_sections_to_empty() {
        let config = ImportReconciler::normalize(&json!({"sections": "nope"})).unwrap();
        assert!(config.sections.is_empty());
    }

    #[test]
    fn test_merge_collapses_redundant_entries() {
        let raw = json!({"sections": [
            {"rounding": [
                {"strategy": "CEIL", "delivery_option": "standard"},
                {"strategy": "FLOOR", "conditions": {"marketplace": true}}
            ]},
            {"rounding": [
                {"strategy": "NEAREST", "delivery_option": "STANDARD"}
            ]}
        ]});
        let config = ImportReconciler::normalize(&raw).unwrap();
        let merged = ImportReconciler::merge_by_common_params(&config.sections);

        assert_eq!(merged.len(), 1);
        let titles: Vec<&str> = merged[0].entries.iter().filter_map(|e| e.title.as_deref()).collect();
        assert_eq!(titles, vec!["Rounding (STANDARD)", "Rounding (STANDARD)", "Rounding (Marketplace)"]);
    }

    #[test]
    fn test_merge_sub_groups_ranges_by_mean_delay() {
        let config = ImportReconciler::normalize(&ranges_doc(json!([
            {"lower_bound": 10, "upper_bound": 20,
             "conditions": {"pdt_greater_than": 18, "pdt_less_than_or_equal_to": 23, "mean_delay_greater_than": 4}},
            {"lower_bound": 5, "upper_bound": 15,
             "conditions": {"pdt_greater_than": 18, "pdt_less_than_or_equal_to": 23, "mean_delay_less_than_or_equal_to": 4}}
        ])))
        .unwrap();
        let merged = ImportReconciler::merge_by_common_params(&config.sections);
        let titles: Vec<&str> = merged[0].entries.iter().filter_map(|e| e.title.as_deref()).collect();
        assert_eq!(
            titles,
            vec!["Ranges PDT 18-23, Mean Delay >4", "Ranges PDT 18-23, Mean Delay <=4"]
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let config = ImportReconciler::normalize(&json!({"sections": [
            {"capping": [
                {"single": {"min": 1, "max": 5}, "conditions": {"delivery_mode": "delivery"}},
                {"ranges": {"min_lower_bound": 1, "min_upper_bound": 2, "max_lower_bound": 3, "max_upper_bound": 4}},
                {"single": {"min": 2, "max": 6}, "conditions": {"delivery_mode": "DELIVERY"}}
            ]}
        ]}))
        .unwrap();
        let once = ImportReconciler::merge_by_common_params(&config.sections);
        let twice = ImportReconciler::merge_by_common_params(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_prepare_reports_parse_errors_without_plan() {
        let err = ImportReconciler::prepare("pdt: [", DocumentKind::Yaml).unwrap_err();
        assert!(matches!(err, ImportError::Parse(ParseError::Yaml(_))));

        let err = ImportReconciler::prepare("{\"variant\": \"x\"}", DocumentKind::Json).unwrap_err();
        assert_eq!(err, ImportError::Invalid(vec![ImportIssue::NoRecognizableSection]));
    }

    #[test]
    fn test_diff_flags_entries_reshaped_by_rebuild() {
        // Two capping entries with identical conditions collapse into one.
        let text = json!({"sections": [{"capping": [
            {"single": {"min": 1, "max": 5}},
            {"ranges": {"min_lower_bound": 1, "min_upper_bound": 2, "max_lower_bound": 3, "max_upper_bound": 4}}
        ]}]})
        .to_string();
        let plan = ImportReconciler::prepare(&text, DocumentKind::Json).unwrap();

        assert_eq!(plan.merged.sections[0].entries.len(), 1);
        assert!(plan.diff.has_changes());
        assert!(plan
            .diff
            .original_annotated
            .iter()
            .any(|l| l.status == LineStatus::Unmatched && l.text.contains("single:")));
        assert!(plan
            .diff
            .merged_annotated
            .iter()
            .all(|l| l.status != LineStatus::Matched));
    }

    #[test]
    fn test_prepare_titles_mean_delay_split_by_shared_bounds() {
        let text = ranges_doc(json!([
            {"lower_bound": 10, "upper_bound": 20,
             "conditions": {"pdt_greater_than": 18, "pdt_less_than_or_equal_to": 23, "mean_delay_greater_than": 4}},
            {"lower_bound": 5, "upper_bound": 15,
             "conditions": {"pdt_greater_than": 18, "pdt_less_than_or_equal_to": 23, "mean_delay_less_than_or_equal_to": 4}}
        ]))
        .to_string();
        let plan = ImportReconciler::prepare(&text, DocumentKind::Json).unwrap();

        let index = rebuild_from_config(&plan.merged, &mut IdCounter::new());
        assert_eq!(index.len(), 1);
        let group = &index.as_slice()[0];
        assert_eq!(group.rules.len(), 2);
        assert_eq!(group.title, "Ranges PDT 18-23");
        assert!(plan.merged.sections[0]
            .entries
            .iter()
            .all(|e| e.title.as_deref() == Some("Ranges PDT 18-23")));
    }

    #[test]
    fn test_prepare_keeps_verticals_containing_commas() {
        let text = ranges_doc(json!([
            {"lower_bound": 10, "upper_bound": 20,
             "conditions": {"vertical_types": ["a,b"], "pdt_less_than_or_equal_to": 13}}
        ]))
        .to_string();
        let plan = ImportReconciler::prepare(&text, DocumentKind::Json).unwrap();

        let conditions = plan.merged.sections[0].entries[0].conditions.as_ref().unwrap();
        assert_eq!(conditions.vertical_types, Some(vec!["a,b".to_string()]));
        assert_eq!(plan.diff.unmatched_lines(), 0);
    }
}
