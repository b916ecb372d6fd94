// Flat document model for delivery-time configuration.
//
// A Config is an ordered list of sections; each section is a flat list of
// entries. This is the shape that is persisted, exported and imported. The
// grouped, editable view lives in rule_store.

use serde::de::Error as DeError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::conditions::{normalize_conditions, whole_number, ConditionError, ConditionSet};

pub const DEFAULT_FORMAT_VERSION: &str = "1";
pub const DEFAULT_VARIANT: &str = "default";

/// Sidecar field carrying a group title on flat entries.
pub const TITLE_FIELD: &str = "_title";

/// The four section kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    DisplayFormat,
    Ranges,
    Capping,
    Rounding,
}

impl SectionType {
    pub const ALL: [SectionType; 4] = [
        SectionType::DisplayFormat,
        SectionType::Ranges,
        SectionType::Capping,
        SectionType::Rounding,
    ];

    /// Key used for the section in both the textual and the JSON form.
    pub fn wire_key(&self) -> &'static str {
        match self {
            SectionType::DisplayFormat => "display_format",
            SectionType::Ranges => "ranges",
            SectionType::Capping => "capping",
            SectionType::Rounding => "rounding",
        }
    }

    /// Human label used in titles.
    pub fn label(&self) -> &'static str {
        match self {
            SectionType::DisplayFormat => "Display Format",
            SectionType::Ranges => "Ranges",
            SectionType::Capping => "Capping",
            SectionType::Rounding => "Rounding",
        }
    }

    pub fn from_wire_key(key: &str) -> Option<Self> {
        SectionType::ALL.into_iter().find(|s| s.wire_key() == key)
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_key())
    }
}

/// How a delivery-time estimate is displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisplayFormat {
    Range,
    Exact,
    Maximum,
}

impl DisplayFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayFormat::Range => "RANGE",
            DisplayFormat::Exact => "EXACT",
            DisplayFormat::Maximum => "MAXIMUM",
        }
    }
}

impl fmt::Display for DisplayFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisplayFormat {
    type Err = EntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RANGE" => Ok(DisplayFormat::Range),
            "EXACT" => Ok(DisplayFormat::Exact),
            "MAXIMUM" => Ok(DisplayFormat::Maximum),
            _ => Err(EntryError::InvalidField {
                field: "format".to_string(),
                reason: format!("unknown display format '{}'", s),
            }),
        }
    }
}

/// Rounding applied to a delivery-time estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundingStrategy {
    Ceil,
    Floor,
    Nearest,
}

impl RoundingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundingStrategy::Ceil => "CEIL",
            RoundingStrategy::Floor => "FLOOR",
            RoundingStrategy::Nearest => "NEAREST",
        }
    }
}

impl FromStr for RoundingStrategy {
    type Err = EntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CEIL" => Ok(RoundingStrategy::Ceil),
            "FLOOR" => Ok(RoundingStrategy::Floor),
            "NEAREST" => Ok(RoundingStrategy::Nearest),
            _ => Err(EntryError::InvalidField {
                field: "strategy".to_string(),
                reason: format!("unknown rounding strategy '{}'", s),
            }),
        }
    }
}

/// A single `[min, max]` cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SingleCap {
    pub min: i64,
    pub max: i64,
}

/// Paired sub-ranges bounding the minimum and the maximum separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeCap {
    pub min_lower_bound: i64,
    pub min_upper_bound: i64,
    pub max_lower_bound: i64,
    pub max_upper_bound: i64,
}

/// Section-specific payload of a flat entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryPayload {
    DisplayFormat {
        format: DisplayFormat,
    },
    Ranges {
        lower_bound: i64,
        upper_bound: i64,
    },
    /// At most one cap of each variant per flat entry.
    Capping {
        single: Option<SingleCap>,
        ranges: Option<RangeCap>,
    },
    Rounding {
        strategy: RoundingStrategy,
    },
}

impl EntryPayload {
    pub fn section(&self) -> SectionType {
        match self {
            EntryPayload::DisplayFormat { .. } => SectionType::DisplayFormat,
            EntryPayload::Ranges { .. } => SectionType::Ranges,
            EntryPayload::Capping { .. } => SectionType::Capping,
            EntryPayload::Rounding { .. } => SectionType::Rounding,
        }
    }
}

/// Entry errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EntryError {
    #[error("entry must be a mapping")]
    NotAMapping,

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error(transparent)]
    Conditions(#[from] ConditionError),
}

/// One element of a section list.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatEntry {
    /// Title of the originating group; presentation only.
    pub title: Option<String>,
    pub delivery_option: Option<String>,
    /// `None` means "no conditions" which is distinct from an empty mapping.
    pub conditions: Option<ConditionSet>,
    pub payload: EntryPayload,
}

impl FlatEntry {
    pub fn new(payload: EntryPayload) -> Self {
        Self {
            title: None,
            delivery_option: None,
            conditions: None,
            payload,
        }
    }

    pub fn with_conditions(mut self, conditions: ConditionSet) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_delivery_option(mut self, option: impl Into<String>) -> Self {
        self.delivery_option = Some(option.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn section(&self) -> SectionType {
        self.payload.section()
    }

    /// Equality over logical content; the title is ignored.
    pub fn logically_eq(&self, other: &FlatEntry) -> bool {
        self.delivery_option == other.delivery_option
            && self.conditions == other.conditions
            && self.payload == other.payload
    }

    /// Serializes the entry with a stable field order.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(title) = &self.title {
            map.insert(TITLE_FIELD.to_string(), Value::String(title.clone()));
        }
        if let Some(option) = &self.delivery_option {
            map.insert("delivery_option".to_string(), Value::String(option.clone()));
        }
        match &self.payload {
            EntryPayload::DisplayFormat { format } => {
                map.insert("format".to_string(), Value::String(format.as_str().to_string()));
            }
            EntryPayload::Ranges {
                lower_bound,
                upper_bound,
            } => {
                map.insert("lower_bound".to_string(), Value::from(*lower_bound));
                map.insert("upper_bound".to_string(), Value::from(*upper_bound));
            }
            EntryPayload::Capping { single, ranges } => {
                if let Some(single) = single {
                    map.insert("single".to_string(), to_json(single));
                }
                if let Some(ranges) = ranges {
                    map.insert("ranges".to_string(), to_json(ranges));
                }
            }
            EntryPayload::Rounding { strategy } => {
                map.insert("strategy".to_string(), Value::String(strategy.as_str().to_string()));
            }
        }
        if let Some(conditions) = &self.conditions {
            map.insert("conditions".to_string(), to_json(conditions));
        }
        Value::Object(map)
    }

    /// Parses an entry of the given section. Conditions are normalized on the
    /// way in.
    pub fn from_value(section: SectionType, value: &Value) -> Result<Self, EntryError> {
        let Value::Object(map) = value else {
            return Err(EntryError::NotAMapping);
        };

        let title = optional_string(map, TITLE_FIELD)?;
        let delivery_option = optional_string(map, "delivery_option")?;
        let conditions = match map.get("conditions") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(normalize_conditions(raw)?),
        };

        let payload = match section {
            SectionType::DisplayFormat => EntryPayload::DisplayFormat {
                format: required_string(map, "format")?.parse()?,
            },
            SectionType::Ranges => EntryPayload::Ranges {
                lower_bound: required_int(map, "lower_bound")?,
                upper_bound: required_int(map, "upper_bound")?,
            },
            SectionType::Capping => EntryPayload::Capping {
                single: optional_struct(map, "single")?,
                ranges: optional_struct(map, "ranges")?,
            },
            SectionType::Rounding => EntryPayload::Rounding {
                strategy: required_string(map, "strategy")?.parse()?,
            },
        };

        Ok(Self {
            title,
            delivery_option,
            conditions,
            payload,
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    // Plain structs of integers and strings cannot fail to serialize.
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn optional_string(map: &Map<String, Value>, field: &str) -> Result<Option<String>, EntryError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(EntryError::InvalidField {
            field: field.to_string(),
            reason: "expected a string".to_string(),
        }),
    }
}

fn required_string(map: &Map<String, Value>, field: &str) -> Result<String, EntryError> {
    optional_string(map, field)?.ok_or_else(|| EntryError::MissingField(field.to_string()))
}

fn int_value(field: &str, value: &Value) -> Result<i64, EntryError> {
    let invalid = |reason: String| EntryError::InvalidField {
        field: field.to_string(),
        reason,
    };
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(whole_number))
            .ok_or_else(|| invalid(format!("expected an integer, found {}", n))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| invalid(e.to_string())),
        _ => Err(invalid("expected an integer".to_string())),
    }
}

fn required_int(map: &Map<String, Value>, field: &str) -> Result<i64, EntryError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(EntryError::MissingField(field.to_string())),
        Some(value) => int_value(field, value),
    }
}

fn optional_struct<T: for<'de> Deserialize<'de>>(
    map: &Map<String, Value>,
    field: &str,
) -> Result<Option<T>, EntryError> {
    let Some(raw) = map.get(field).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let Value::Object(inner) = raw else {
        return Err(EntryError::InvalidField {
            field: field.to_string(),
            reason: "expected a mapping".to_string(),
        });
    };
    // Accept integer strings inside caps as well.
    let mut coerced = Map::new();
    for (key, value) in inner {
        let value = match value {
            Value::String(_) => Value::from(int_value(&format!("{}.{}", field, key), value)?),
            other => other.clone(),
        };
        coerced.insert(key.clone(), value);
    }
    serde_json::from_value(Value::Object(coerced))
        .map(Some)
        .map_err(|e| EntryError::InvalidField {
            field: field.to_string(),
            reason: e.to_string(),
        })
}

/// A flat section: all entries of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub kind: SectionType,
    pub entries: Vec<FlatEntry>,
}

impl Section {
    pub fn new(kind: SectionType) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    pub fn with_entries(kind: SectionType, entries: Vec<FlatEntry>) -> Self {
        Self { kind, entries }
    }
}

// A section serializes as a single-key mapping: `{"ranges": [...]}`.
impl Serialize for Section {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<Value> = self.entries.iter().map(FlatEntry::to_value).collect();
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.kind.wire_key(), &entries)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Section {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Value::Object(map) = value else {
            return Err(D::Error::custom("section must be a mapping"));
        };
        if map.len() != 1 {
            return Err(D::Error::custom(format!(
                "section must have exactly one key, found {}",
                map.len()
            )));
        }
        let Some((key, raw_entries)) = map.into_iter().next() else {
            return Err(D::Error::custom("section must have exactly one key"));
        };
        let kind = SectionType::from_wire_key(&key)
            .ok_or_else(|| D::Error::custom(format!("unknown section '{}'", key)))?;
        let entries = match raw_entries {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    FlatEntry::from_value(kind, item)
                        .map_err(|e| D::Error::custom(format!("{}[{}]: {}", key, i, e)))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Value::Null => Vec::new(),
            _ => return Err(D::Error::custom(format!("section '{}' must be a list", key))),
        };
        Ok(Section { kind, entries })
    }
}

/// A complete configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub format_version: String,
    pub variant: String,
    pub platform: String,
    pub country_code: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Config {
    /// Section kinds in order of first appearance.
    pub fn section_kinds(&self) -> Vec<SectionType> {
        let mut kinds = Vec::new();
        for section in &self.sections {
            if !kinds.contains(&section.kind) {
                kinds.push(section.kind);
            }
        }
        kinds
    }

    /// All entries of one kind across every section of that kind.
    pub fn entries_of(&self, kind: SectionType) -> impl Iterator<Item = &FlatEntry> {
        self.sections
            .iter()
            .filter(move |s| s.kind == kind)
            .flat_map(|s| s.entries.iter())
    }

    pub fn entry_count(&self) -> usize {
        self.sections.iter().map(|s| s.entries.len()).sum()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            format_version: DEFAULT_FORMAT_VERSION.to_string(),
            variant: DEFAULT_VARIANT.to_string(),
            platform: String::new(),
            country_code: String::new(),
            sections: Vec::new(),
        }
    }
}

/// Top-level metadata fields, for editing them by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetadataField {
    FormatVersion,
    Variant,
    Platform,
    CountryCode,
}

impl MetadataField {
    pub const ALL: [MetadataField; 4] = [
        MetadataField::FormatVersion,
        MetadataField::Variant,
        MetadataField::Platform,
        MetadataField::CountryCode,
    ];

    /// In-memory (camelCase) name.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            MetadataField::FormatVersion => "formatVersion",
            MetadataField::Variant => "variant",
            MetadataField::Platform => "platform",
            MetadataField::CountryCode => "countryCode",
        }
    }

    /// Textual-form (snake_case) name.
    pub fn wire_name(&self) -> &'static str {
        match self {
            MetadataField::FormatVersion => "config_format_version",
            MetadataField::Variant => "variant",
            MetadataField::Platform => "platform",
            MetadataField::CountryCode => "country_code",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            MetadataField::FormatVersion => DEFAULT_FORMAT_VERSION,
            MetadataField::Variant => DEFAULT_VARIANT,
            MetadataField::Platform | MetadataField::CountryCode => "",
        }
    }

    pub fn get<'a>(&self, config: &'a Config) -> &'a str {
        match self {
            MetadataField::FormatVersion => &config.format_version,
            MetadataField::Variant => &config.variant,
            MetadataField::Platform => &config.platform,
            MetadataField::CountryCode => &config.country_code,
        }
    }

    pub fn set(&self, config: &mut Config, value: String) {
        match self {
            MetadataField::FormatVersion => config.format_version = value,
            MetadataField::Variant => config.variant = value,
            MetadataField::Platform => config.platform = value,
            MetadataField::CountryCode => config.country_code = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::DeliveryMode;
    use serde_json::json;

    #[test]
    fn test_section_json_shape() {
        let section = Section::with_entries(
            SectionType::Ranges,
            vec![FlatEntry::new(EntryPayload::Ranges {
                lower_bound: 10,
                upper_bound: 20,
            })
            .with_delivery_option("STANDARD")],
        );

        let value = serde_json::to_value(&section).unwrap();
        assert_eq!(
            value,
            json!({"ranges": [{"delivery_option": "STANDARD", "lower_bound": 10, "upper_bound": 20}]})
        );

        let back: Section = serde_json::from_value(value).unwrap();
        assert_eq!(back, section);
    }

    #[test]
    fn test_section_rejects_multiple_keys() {
        let err = serde_json::from_value::<Section>(json!({"ranges": [], "capping": []}));
        assert!(err.is_err());
    }

    #[test]
    fn test_entry_parses_lenient_numbers_and_conditions() {
        let raw = json!({
            "lower_bound": "5",
            "upper_bound": 15.0,
            "conditions": {"delivery_mode": "delivery", "marketplace": "false"}
        });
        let entry = FlatEntry::from_value(SectionType::Ranges, &raw).unwrap();
        assert_eq!(
            entry.payload,
            EntryPayload::Ranges {
                lower_bound: 5,
                upper_bound: 15
            }
        );
        let conditions = entry.conditions.unwrap();
        assert_eq!(conditions.delivery_mode, Some(DeliveryMode::Delivery));
        assert_eq!(conditions.marketplace, Some(false));
    }

    #[test]
    fn test_display_format_renders_wire_value() {
        assert_eq!(DisplayFormat::Maximum.to_string(), "MAXIMUM");
        assert_eq!(DisplayFormat::Range.to_string().parse::<DisplayFormat>(), Ok(DisplayFormat::Range));
    }

    #[test]
    fn test_entry_rejects_out_of_range_float() {
        let raw = json!({"lower_bound": 1e20, "upper_bound": 10});
        let err = FlatEntry::from_value(SectionType::Ranges, &raw).unwrap_err();
        assert!(matches!(err, EntryError::InvalidField { ref field, .. } if field == "lower_bound"));

        let raw = json!({"lower_bound": -1e19, "upper_bound": 10});
        assert!(FlatEntry::from_value(SectionType::Ranges, &raw).is_err());
    }

    #[test]
    fn test_entry_missing_required_field() {
        let err = FlatEntry::from_value(SectionType::DisplayFormat, &json!({"conditions": {}}))
            .unwrap_err();
        assert_eq!(err, EntryError::MissingField("format".to_string()));
    }

    #[test]
    fn test_capping_entry_carries_both_variants() {
        let raw = json!({
            "single": {"min": 10, "max": 60},
            "ranges": {"min_lower_bound": 5, "min_upper_bound": 10, "max_lower_bound": 40, "max_upper_bound": "60"}
        });
        let entry = FlatEntry::from_value(SectionType::Capping, &raw).unwrap();
        match entry.payload {
            EntryPayload::Capping { single, ranges } => {
                assert_eq!(single, Some(SingleCap { min: 10, max: 60 }));
                assert_eq!(ranges.map(|r| r.max_upper_bound), Some(60));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_logical_equality_ignores_title() {
        let a = FlatEntry::new(EntryPayload::Rounding {
            strategy: RoundingStrategy::Ceil,
        })
        .with_title("A");
        let b = a.clone().with_title("B");
        assert!(a.logically_eq(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_config_uses_camel_case_metadata() {
        let config = Config::default();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["formatVersion"], json!("1"));
        assert_eq!(value["countryCode"], json!(""));
        assert_eq!(value["sections"], json!([]));
    }
}
