// Textual and JSON forms of a configuration.
//
// This module provides:
// 1. Deterministic emission of the section-commented textual form
// 2. Line spans for every emitted entry, used by the import diff
// 3. Parsing of YAML and JSON documents into a raw object tree
// 4. The snake_case <-> camelCase translation of top-level metadata keys
//
// Structural YAML parsing is delegated to serde_yaml. Comments are a
// presentation layer: on the way in they only ever supply `_title`.

use serde_json::{Map, Value};
use std::fmt;
use std::ops::Range;
use thiserror::Error;

use crate::conditions::{describe_range, ConditionSet, BOUND_KEYS};
use crate::config_model::{Config, EntryPayload, FlatEntry, MetadataField, SectionType, TITLE_FIELD};

const SECTIONS_KEY: &str = "sections";
const WIRE_SECTIONS_KEY: &str = "pdt";
const ITEM_INDENT: &str = "  ";
const ENTRY_INDENT: &str = "      ";
const FIELD_INDENT: &str = "        ";

/// Input/output document format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Yaml,
    Json,
}

impl DocumentKind {
    /// Maps a file extension (without the dot) to a document kind.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "yml" | "yaml" => Some(DocumentKind::Yaml),
            "json" => Some(DocumentKind::Json),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DocumentKind::Yaml => "yaml",
            DocumentKind::Json => "json",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Yaml => f.write_str("YAML"),
            DocumentKind::Json => f.write_str("JSON"),
        }
    }
}

/// Parsing errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("Document is empty")]
    Empty,

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("JSON parse error: {0}")]
    Json(String),

    #[error("Document root must be a mapping, found {0}")]
    NotAMapping(String),

    #[error("Invalid configuration: {0}")]
    Shape(String),

    #[error("Serialization error: {0}")]
    Encode(String),
}

/// Lines occupied by one emitted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySpan {
    pub kind: SectionType,
    pub section_index: usize,
    pub entry_index: usize,
    /// Zero-based, end-exclusive line range. Comment lines are not included.
    pub lines: Range<usize>,
}

/// Generated text plus the position of every entry in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub text: String,
    pub spans: Vec<EntrySpan>,
}

impl RenderedDocument {
    pub fn lines(&self) -> Vec<&str> {
        self.text.lines().collect()
    }
}

/// Configuration serializer and parser
pub struct SerializationEngine;

impl SerializationEngine {
    /// Textual form of `config`.
    pub fn generate(config: &Config) -> String {
        Self::render(config).text
    }

    /// Textual form of `config` with entry spans.
    ///
    /// Header keys come first in fixed order, then `pdt:` with one item per
    /// section in `config.sections` order. Ranges entries are clustered by
    /// their range description under one comment per cluster; other entries
    /// are preceded by their title as a comment.
    pub fn render(config: &Config) -> RenderedDocument {
        let mut writer = Writer::default();

        writer.push(format!(
            "{}: {}",
            MetadataField::FormatVersion.wire_name(),
            json_quoted(&config.format_version)
        ));
        for field in [MetadataField::Variant, MetadataField::Platform, MetadataField::CountryCode] {
            writer.push(format!("{}: {}", field.wire_name(), yaml_str(field.get(config))));
        }
        writer.push(String::new());

        if config.sections.is_empty() {
            writer.push(format!("{}: []", WIRE_SECTIONS_KEY));
            return writer.finish();
        }

        writer.push(format!("{}:", WIRE_SECTIONS_KEY));
        for (section_index, section) in config.sections.iter().enumerate() {
            let key = section.kind.wire_key();
            if section.entries.is_empty() {
                writer.push(format!("{}- {}: []", ITEM_INDENT, key));
                continue;
            }
            writer.push(format!("{}- {}:", ITEM_INDENT, key));

            if section.kind == SectionType::Ranges {
                for (description, members) in range_clusters(&section.entries) {
                    writer.push(format!("{}# {}", ENTRY_INDENT, description));
                    for entry_index in members {
                        writer.entry(section.kind, section_index, entry_index, &section.entries[entry_index]);
                    }
                }
            } else {
                for (entry_index, entry) in section.entries.iter().enumerate() {
                    if let Some(title) = entry.title.as_deref().map(single_line).filter(|t| !t.is_empty()) {
                        writer.push(format!("{}# {}", ENTRY_INDENT, title));
                    }
                    writer.entry(section.kind, section_index, entry_index, entry);
                }
            }
        }

        writer.finish()
    }

    /// Pretty-printed JSON form, with camelCase top-level keys.
    pub fn to_json(config: &Config) -> Result<String, ParseError> {
        serde_json::to_string_pretty(config).map_err(|e| ParseError::Encode(e.to_string()))
    }

    /// Parses a document into a raw object tree.
    ///
    /// Snake_case metadata keys (`config_format_version`, `country_code`,
    /// `pdt`) are promoted to their canonical names. For YAML input, a comment
    /// directly above an entry of a non-ranges section becomes its `_title`.
    pub fn parse(text: &str, kind: DocumentKind) -> Result<Value, ParseError> {
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let value: Value = match kind {
            DocumentKind::Yaml => serde_yaml::from_str(text).map_err(|e| ParseError::Yaml(e.to_string()))?,
            DocumentKind::Json => serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?,
        };
        let mut map = match value {
            Value::Object(map) => map,
            other => return Err(ParseError::NotAMapping(value_kind(&other).to_string())),
        };

        canonicalize_keys(&mut map);
        if kind == DocumentKind::Yaml {
            for comment in scan_comment_titles(text) {
                attach_title(&mut map, comment);
            }
        }
        Ok(Value::Object(map))
    }

    /// Strict parse into a [`Config`]: every metadata field must be present.
    /// Lenient loading of foreign documents goes through the import
    /// reconciler instead.
    pub fn parse_config(text: &str, kind: DocumentKind) -> Result<Config, ParseError> {
        let value = Self::parse(text, kind)?;
        serde_json::from_value(value).map_err(|e| ParseError::Shape(e.to_string()))
    }
}

/// Promotes snake_case top-level keys to their canonical names. A key that
/// is already present in canonical form wins.
pub fn canonicalize_keys(map: &mut Map<String, Value>) {
    let renames = [
        (MetadataField::FormatVersion.wire_name(), MetadataField::FormatVersion.canonical_name()),
        (MetadataField::CountryCode.wire_name(), MetadataField::CountryCode.canonical_name()),
        (WIRE_SECTIONS_KEY, SECTIONS_KEY),
    ];
    for (wire, canonical) in renames {
        if map.contains_key(canonical) {
            continue;
        }
        if let Some(value) = map.remove(wire) {
            map.insert(canonical.to_string(), value);
        }
    }
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

// ============================================================================
// Emission
// ============================================================================

#[derive(Default)]
struct Writer {
    lines: Vec<String>,
    spans: Vec<EntrySpan>,
}

impl Writer {
    fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    fn entry(&mut self, kind: SectionType, section_index: usize, entry_index: usize, entry: &FlatEntry) {
        let start = self.lines.len();
        let body = entry_lines(entry);
        if body.is_empty() {
            self.lines.push(format!("{}- {{}}", ENTRY_INDENT));
        }
        for (i, line) in body.into_iter().enumerate() {
            if i == 0 {
                self.lines.push(format!("{}- {}", ENTRY_INDENT, line));
            } else {
                self.lines.push(format!("{}{}", FIELD_INDENT, line));
            }
        }
        self.spans.push(EntrySpan {
            kind,
            section_index,
            entry_index,
            lines: start..self.lines.len(),
        });
    }

    fn finish(self) -> RenderedDocument {
        let mut text = self.lines.join("\n");
        text.push('\n');
        RenderedDocument {
            text,
            spans: self.spans,
        }
    }
}

/// Entry indices clustered by range description, in first-seen order.
fn range_clusters(entries: &[FlatEntry]) -> Vec<(String, Vec<usize>)> {
    let mut clusters: Vec<(String, Vec<usize>)> = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let description = entry
            .conditions
            .as_ref()
            .map(describe_range)
            .unwrap_or_else(|| "Default".to_string());
        match clusters.iter_mut().find(|(d, _)| *d == description) {
            Some((_, members)) => members.push(index),
            None => clusters.push((description, vec![index])),
        }
    }
    clusters
}

/// Entry fields relative to the entry's own indentation.
fn entry_lines(entry: &FlatEntry) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(option) = &entry.delivery_option {
        lines.push(format!("delivery_option: {}", yaml_str(option)));
    }

    match &entry.payload {
        EntryPayload::DisplayFormat { format } => lines.push(format!("format: {}", format.as_str())),
        EntryPayload::Ranges {
            lower_bound,
            upper_bound,
        } => {
            lines.push(format!("lower_bound: {}", lower_bound));
            lines.push(format!("upper_bound: {}", upper_bound));
        }
        EntryPayload::Capping { single, ranges } => {
            if let Some(single) = single {
                lines.push("single:".to_string());
                lines.push(format!("  min: {}", single.min));
                lines.push(format!("  max: {}", single.max));
            }
            if let Some(ranges) = ranges {
                lines.push("ranges:".to_string());
                lines.push(format!("  min_lower_bound: {}", ranges.min_lower_bound));
                lines.push(format!("  min_upper_bound: {}", ranges.min_upper_bound));
                lines.push(format!("  max_lower_bound: {}", ranges.max_lower_bound));
                lines.push(format!("  max_upper_bound: {}", ranges.max_upper_bound));
            }
        }
        EntryPayload::Rounding { strategy } => lines.push(format!("strategy: {}", strategy.as_str())),
    }

    if let Some(conditions) = &entry.conditions {
        if conditions.is_empty() {
            lines.push("conditions: {}".to_string());
        } else {
            lines.push("conditions:".to_string());
            lines.extend(condition_lines(conditions).into_iter().map(|l| format!("  {}", l)));
        }
    }
    lines
}

fn condition_lines(conditions: &ConditionSet) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(mode) = conditions.delivery_mode {
        lines.push(format!("delivery_mode: {}", mode.as_str()));
    }
    if let Some(marketplace) = conditions.marketplace {
        lines.push(format!("marketplace: {}", marketplace));
    }
    if let Some(verticals) = &conditions.vertical_types {
        if verticals.is_empty() {
            lines.push("vertical_types: []".to_string());
        } else {
            lines.push("vertical_types:".to_string());
            lines.extend(verticals.iter().map(|v| format!("  - {}", yaml_str(v))));
        }
    }
    let bounds = conditions.bounds();
    for key in BOUND_KEYS {
        if let Some(value) = bounds.get(key) {
            lines.push(format!("{}: {}", key, value));
        }
    }
    for (key, value) in &conditions.extra {
        lines.push(format!("{}: {}", yaml_str(key), yaml_value(value)));
    }
    lines
}

fn yaml_value(value: &Value) -> String {
    match value {
        Value::String(s) => yaml_str(s),
        Value::Null => "null".to_string(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        // JSON flow collections are valid YAML.
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn json_quoted(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// Renders a string as a plain YAML scalar when that cannot change its
/// meaning, and as a double-quoted scalar otherwise.
pub fn yaml_str(s: &str) -> String {
    const RESERVED: [&str; 11] = ["true", "false", "null", "yes", "no", "on", "off", "y", "n", "~", "nan"];

    let plain = s
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '+' | ' '))
        && !s.ends_with(' ')
        && !RESERVED.contains(&s.to_ascii_lowercase().as_str());

    if plain {
        s.to_string()
    } else {
        json_quoted(s)
    }
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Comment titles
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct CommentTitle {
    section_index: usize,
    entry_index: usize,
    title: String,
}

/// Finds comments placed directly above entries of non-ranges sections.
///
/// The first dash line below `pdt:` fixes the indentation of section items;
/// the first dash line below an item fixes the indentation of its entries.
/// Any other content line between a comment and an entry discards the
/// comment.
fn scan_comment_titles(text: &str) -> Vec<CommentTitle> {
    let mut titles = Vec::new();
    let mut in_sections = false;
    let mut item_indent: Option<usize> = None;
    let mut entry_indent: Option<usize> = None;
    let mut section_index: Option<usize> = None;
    let mut items_seen = 0usize;
    let mut entry_index = 0usize;
    let mut is_ranges = false;
    let mut pending: Option<String> = None;

    for raw in text.lines() {
        let trimmed = raw.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        let indent = raw.len() - trimmed.len();
        let dash = trimmed == "-" || trimmed.starts_with("- ");

        if indent == 0 && !trimmed.starts_with('#') && !(dash && in_sections) {
            in_sections = trimmed.starts_with("pdt:") || trimmed.starts_with("sections:");
            item_indent = None;
            section_index = None;
            pending = None;
            continue;
        }
        if !in_sections {
            continue;
        }

        if trimmed.starts_with('#') {
            if section_index.is_some() {
                pending = Some(trimmed.trim_start_matches('#').trim().to_string());
            }
            continue;
        }

        if dash && item_indent.map_or(true, |i| i == indent) {
            item_indent = Some(indent);
            let key = trimmed
                .strip_prefix('-')
                .unwrap_or("")
                .split(':')
                .next()
                .unwrap_or("")
                .trim();
            is_ranges = key == SectionType::Ranges.wire_key();
            section_index = Some(items_seen);
            items_seen += 1;
            entry_indent = None;
            entry_index = 0;
            pending = None;
            continue;
        }

        let Some(current_section) = section_index else {
            continue;
        };
        let below_item = item_indent.is_some_and(|i| indent > i);
        if dash && below_item && entry_indent.map_or(true, |e| e == indent) {
            entry_indent = Some(indent);
            if let Some(title) = pending.take().filter(|t| !t.is_empty()) {
                if !is_ranges {
                    titles.push(CommentTitle {
                        section_index: current_section,
                        entry_index,
                        title,
                    });
                }
            }
            entry_index += 1;
            continue;
        }

        pending = None;
    }

    titles
}

fn attach_title(map: &mut Map<String, Value>, comment: CommentTitle) {
    let Some(Value::Array(sections)) = map.get_mut(SECTIONS_KEY) else {
        return;
    };
    let Some(Value::Object(section)) = sections.get_mut(comment.section_index) else {
        return;
    };
    let Some(Value::Array(entries)) = section.values_mut().next() else {
        return;
    };
    if let Some(Value::Object(entry)) = entries.get_mut(comment.entry_index) {
        entry
            .entry(TITLE_FIELD.to_string())
            .or_insert(Value::String(comment.title));
    }
}
