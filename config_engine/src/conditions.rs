// Condition sets attached to configuration entries.
//
// This module provides:
// 1. The typed condition record plus a passthrough bucket for unknown keys
// 2. Normalization of loosely typed condition mappings from imported documents
// 3. Canonical grouping keys and common-parameter extraction
// 4. Half-open bound intervals and their human readable descriptions
//
// Everything here is a pure function over condition data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config_model::SectionType;

pub const DELIVERY_OPTION: &str = "delivery_option";
pub const DELIVERY_MODE: &str = "delivery_mode";
pub const MARKETPLACE: &str = "marketplace";
pub const VERTICAL_TYPES: &str = "vertical_types";
pub const PDT_GREATER_THAN: &str = "pdt_greater_than";
pub const PDT_LESS_THAN_OR_EQUAL_TO: &str = "pdt_less_than_or_equal_to";
pub const MEAN_DELAY_GREATER_THAN: &str = "mean_delay_greater_than";
pub const MEAN_DELAY_LESS_THAN_OR_EQUAL_TO: &str = "mean_delay_less_than_or_equal_to";

/// Numeric condition keys, in emission order.
pub const BOUND_KEYS: [&str; 4] = [
    PDT_GREATER_THAN,
    PDT_LESS_THAN_OR_EQUAL_TO,
    MEAN_DELAY_GREATER_THAN,
    MEAN_DELAY_LESS_THAN_OR_EQUAL_TO,
];

/// Every condition key with a typed field on [`ConditionSet`].
pub const KNOWN_CONDITION_KEYS: [&str; 7] = [
    DELIVERY_MODE,
    MARKETPLACE,
    VERTICAL_TYPES,
    PDT_GREATER_THAN,
    PDT_LESS_THAN_OR_EQUAL_TO,
    MEAN_DELAY_GREATER_THAN,
    MEAN_DELAY_LESS_THAN_OR_EQUAL_TO,
];

/// Rendered in place of an empty `vertical_types` list.
pub const ANY_VERTICAL: &str = "ANY";

/// Parameters factored out of display-format entries.
pub const DISPLAY_FORMAT_PARAMS: &[&str] = &[
    DELIVERY_MODE,
    MARKETPLACE,
    PDT_LESS_THAN_OR_EQUAL_TO,
    VERTICAL_TYPES,
];

/// Parameters factored out of ranges, capping and rounding entries.
pub const RULE_PARAMS: &[&str] = &[DELIVERY_OPTION, DELIVERY_MODE, MARKETPLACE, VERTICAL_TYPES];

/// Returns the common-parameter keys used to group entries of a section.
pub fn grouping_params(section: SectionType) -> &'static [&'static str] {
    match section {
        SectionType::DisplayFormat => DISPLAY_FORMAT_PARAMS,
        SectionType::Ranges | SectionType::Capping | SectionType::Rounding => RULE_PARAMS,
    }
}

/// Condition errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("conditions must be a mapping, found {0}")]
    NotAMapping(String),

    #[error("invalid value for condition '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("unknown delivery mode: {0}")]
    UnknownDeliveryMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    Delivery,
    Pickup,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Delivery => "DELIVERY",
            DeliveryMode::Pickup => "PICKUP",
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DELIVERY" => Ok(DeliveryMode::Delivery),
            "PICKUP" => Ok(DeliveryMode::Pickup),
            _ => Err(ConditionError::UnknownDeliveryMode(s.to_string())),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named predicates attached to an entry.
///
/// Recognized keys have typed fields; anything else is carried verbatim in
/// `extra` so documents produced by newer tooling survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketplace: Option<bool>,
    /// Ordered; the first vertical is the primary one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdt_greater_than: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdt_less_than_or_equal_to: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_delay_greater_than: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_delay_less_than_or_equal_to: Option<i64>,
    /// Unrecognized keys, preserved as found.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no predicate at all is set.
    pub fn is_empty(&self) -> bool {
        self.delivery_mode.is_none()
            && self.marketplace.is_none()
            && self.vertical_types.is_none()
            && self.bounds().is_unbounded()
            && self.extra.is_empty()
    }

    pub fn bounds(&self) -> Bounds {
        Bounds {
            pdt_greater_than: self.pdt_greater_than,
            pdt_less_than_or_equal_to: self.pdt_less_than_or_equal_to,
            mean_delay_greater_than: self.mean_delay_greater_than,
            mean_delay_less_than_or_equal_to: self.mean_delay_less_than_or_equal_to,
        }
    }

    /// Canonical string rendering of one predicate, as used in grouping keys
    /// and common parameters.
    pub fn param_value(&self, key: &str) -> Option<String> {
        match key {
            DELIVERY_MODE => self.delivery_mode.map(|m| m.as_str().to_string()),
            MARKETPLACE => self.marketplace.map(|b| b.to_string()),
            VERTICAL_TYPES => self.vertical_types.as_ref().map(|v| {
                if v.is_empty() {
                    ANY_VERTICAL.to_string()
                } else {
                    join_verticals(v)
                }
            }),
            PDT_GREATER_THAN
            | PDT_LESS_THAN_OR_EQUAL_TO
            | MEAN_DELAY_GREATER_THAN
            | MEAN_DELAY_LESS_THAN_OR_EQUAL_TO => self.bounds().get(key).map(|v| v.to_string()),
            other => self.extra.get(other).map(render_passthrough),
        }
    }

    /// Inverse of [`ConditionSet::param_value`].
    pub fn set_param(&mut self, key: &str, value: &str) -> Result<(), ConditionError> {
        match key {
            DELIVERY_MODE => self.delivery_mode = Some(value.parse()?),
            MARKETPLACE => {
                self.marketplace = Some(parse_bool(value).ok_or_else(|| {
                    ConditionError::InvalidValue {
                        key: key.to_string(),
                        reason: format!("expected true or false, found '{}'", value),
                    }
                })?)
            }
            VERTICAL_TYPES => {
                let trimmed = value.trim();
                self.vertical_types = Some(if trimmed.is_empty() || trimmed == ANY_VERTICAL {
                    Vec::new()
                } else {
                    split_verticals(trimmed)
                });
            }
            PDT_GREATER_THAN
            | PDT_LESS_THAN_OR_EQUAL_TO
            | MEAN_DELAY_GREATER_THAN
            | MEAN_DELAY_LESS_THAN_OR_EQUAL_TO => {
                let parsed = value.trim().parse::<i64>().map_err(|e| ConditionError::InvalidValue {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                let mut bounds = self.bounds();
                bounds.set(key, Some(parsed));
                bounds.write_to(self);
            }
            other => {
                self.extra.insert(other.to_string(), Value::String(value.to_string()));
            }
        }
        Ok(())
    }

    /// Builds a condition set from common parameters. `delivery_option` is an
    /// entry-level field and is skipped.
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self, ConditionError> {
        let mut conditions = ConditionSet::new();
        for (key, value) in params {
            if key == DELIVERY_OPTION {
                continue;
            }
            conditions.set_param(key, value)?;
        }
        Ok(conditions)
    }
}

/// Joins vertical types into one parameter value. A comma or backslash
/// inside a vertical is escaped with a backslash.
pub fn join_verticals(verticals: &[String]) -> String {
    verticals
        .iter()
        .map(|v| v.replace('\\', "\\\\").replace(',', "\\,"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`join_verticals`]. Blank items are dropped.
pub fn split_verticals(value: &str) -> Vec<String> {
    let mut verticals = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' => verticals.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    verticals.push(current);
    verticals
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Whole-number float as an integer, or `None` when it has a fraction or
/// does not fit in an `i64`.
pub fn whole_number(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn render_passthrough(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
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

/// Coerces a raw condition mapping into a [`ConditionSet`].
///
/// - `marketplace: "true"` / `"false"` become booleans
/// - a scalar `vertical_types` becomes a one-element list
/// - `delivery_mode` is upper-cased
/// - numeric bounds given as strings or whole floats become integers
/// - explicit nulls on recognized keys count as absent
/// - unknown keys are left untouched
pub fn normalize_conditions(raw: &Value) -> Result<ConditionSet, ConditionError> {
    let Value::Object(source) = raw else {
        return Err(ConditionError::NotAMapping(value_kind(raw).to_string()));
    };
    let mut map = source.clone();

    for key in KNOWN_CONDITION_KEYS {
        if matches!(map.get(key), Some(Value::Null)) {
            map.remove(key);
        }
    }

    let marketplace = match map.get(MARKETPLACE) {
        Some(Value::String(s)) => parse_bool(s),
        _ => None,
    };
    if let Some(b) = marketplace {
        map.insert(MARKETPLACE.to_string(), Value::Bool(b));
    }

    let verticals = match map.get(VERTICAL_TYPES) {
        Some(Value::String(s)) => Some(vec![Value::String(s.trim().to_string())]),
        Some(Value::Number(n)) => Some(vec![Value::String(n.to_string())]),
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|item| match item {
                    Value::Number(n) => Value::String(n.to_string()),
                    other => other.clone(),
                })
                .collect(),
        ),
        _ => None,
    };
    if let Some(items) = verticals {
        map.insert(VERTICAL_TYPES.to_string(), Value::Array(items));
    }

    let mode = match map.get(DELIVERY_MODE) {
        Some(Value::String(s)) => Some(s.trim().to_ascii_uppercase()),
        _ => None,
    };
    if let Some(mode) = mode {
        map.insert(DELIVERY_MODE.to_string(), Value::String(mode));
    }

    for key in BOUND_KEYS {
        let coerced = match map.get(key) {
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            Some(Value::Number(n)) if n.is_f64() => match n.as_f64().and_then(whole_number) {
                Some(v) => Some(v),
                None => {
                    return Err(ConditionError::InvalidValue {
                        key: key.to_string(),
                        reason: format!("expected an integer, found {}", n),
                    })
                }
            },
            _ => None,
        };
        if let Some(v) = coerced {
            map.insert(key.to_string(), Value::Number(Number::from(v)));
        }
    }

    serde_json::from_value(Value::Object(map)).map_err(|e| ConditionError::InvalidValue {
        key: "conditions".to_string(),
        reason: e.to_string(),
    })
}

/// Upper-cases a delivery option so grouping is case-insensitive.
pub fn normalize_delivery_option(option: &str) -> String {
    option.trim().to_ascii_uppercase()
}

/// Extracts the common parameters of an entry: its `delivery_option` (when
/// present) plus each key of `param_keys` set on `conditions`.
pub fn common_params(
    delivery_option: Option<&str>,
    conditions: Option<&ConditionSet>,
    param_keys: &[&str],
) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    if let Some(option) = delivery_option.filter(|o| !o.trim().is_empty()) {
        params.insert(DELIVERY_OPTION.to_string(), normalize_delivery_option(option));
    }
    if let Some(conditions) = conditions {
        for key in param_keys {
            if *key == DELIVERY_OPTION {
                continue;
            }
            if let Some(value) = conditions.param_value(key) {
                params.insert(key.to_string(), value);
            }
        }
    }
    params
}

/// Canonical, order-independent grouping key.
///
/// The three shapes never collide:
/// - `conditions:none` for an entry with neither conditions nor delivery option
/// - `delivery_option:<OPT>|conditions:delivery_option_only` when only the
///   delivery option is set
/// - `delivery_option:<OPT>|<param>:<value>|...` otherwise, or
///   `conditions:empty` for an explicit but empty condition mapping
pub fn grouping_key(
    delivery_option: Option<&str>,
    conditions: Option<&ConditionSet>,
    param_keys: &[&str],
) -> String {
    let params = common_params(delivery_option, conditions, param_keys);
    match conditions {
        None => match params.get(DELIVERY_OPTION) {
            None => "conditions:none".to_string(),
            Some(option) => format!(
                "{}:{}|conditions:delivery_option_only",
                DELIVERY_OPTION, option
            ),
        },
        Some(_) if params.is_empty() => "conditions:empty".to_string(),
        Some(_) => params_key(&params),
    }
}

/// Joins common parameters into key segments, delivery option first.
pub fn params_key(params: &BTreeMap<String, String>) -> String {
    let mut segments = Vec::with_capacity(params.len());
    if let Some(option) = params.get(DELIVERY_OPTION) {
        segments.push(format!("{}:{}", DELIVERY_OPTION, option));
    }
    for (key, value) in params {
        if key != DELIVERY_OPTION {
            segments.push(format!("{}:{}", key, value));
        }
    }
    segments.join("|")
}

/// Half-open interval `(greater_than, less_than_or_equal_to]`. Missing ends
/// are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interval {
    pub greater_than: Option<i64>,
    pub less_than_or_equal_to: Option<i64>,
}

impl Interval {
    pub fn new(greater_than: Option<i64>, less_than_or_equal_to: Option<i64>) -> Self {
        Self {
            greater_than,
            less_than_or_equal_to,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.greater_than.is_none() && self.less_than_or_equal_to.is_none()
    }

    /// Exclusive lower end, `i64::MIN` when unbounded.
    pub fn lower(&self) -> i64 {
        self.greater_than.unwrap_or(i64::MIN)
    }

    /// Inclusive upper end, `i64::MAX` when unbounded.
    pub fn upper(&self) -> i64 {
        self.less_than_or_equal_to.unwrap_or(i64::MAX)
    }

    /// One interval ends exactly where the other begins.
    pub fn is_adjacent_to(&self, other: &Interval) -> bool {
        let touches = |a: &Interval, b: &Interval| {
            a.less_than_or_equal_to.is_some() && a.less_than_or_equal_to == b.greater_than
        };
        touches(self, other) || touches(other, self)
    }

    /// Adjacent intervals never overlap, even when the generic test below
    /// would say otherwise for degenerate bounds.
    pub fn overlaps(&self, other: &Interval) -> bool {
        if self.is_adjacent_to(other) {
            return false;
        }
        self.lower().max(other.lower()) < self.upper().min(other.upper())
    }

    /// Both ends set and the interval is empty.
    pub fn is_inverted(&self) -> bool {
        matches!(
            (self.greater_than, self.less_than_or_equal_to),
            (Some(gt), Some(lte)) if gt >= lte
        )
    }

    pub fn describe(&self) -> Option<String> {
        match (self.greater_than, self.less_than_or_equal_to) {
            (Some(gt), Some(lte)) => Some(format!("{}-{}", gt, lte)),
            (Some(gt), None) => Some(format!(">{}", gt)),
            (None, Some(lte)) => Some(format!("<={}", lte)),
            (None, None) => None,
        }
    }
}

/// The PDT and Mean-Delay bound pairs of an entry or rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdt_greater_than: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdt_less_than_or_equal_to: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_delay_greater_than: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_delay_less_than_or_equal_to: Option<i64>,
}

impl Bounds {
    pub fn pdt(&self) -> Interval {
        Interval::new(self.pdt_greater_than, self.pdt_less_than_or_equal_to)
    }

    pub fn mean_delay(&self) -> Interval {
        Interval::new(self.mean_delay_greater_than, self.mean_delay_less_than_or_equal_to)
    }

    pub fn is_unbounded(&self) -> bool {
        self.pdt().is_unbounded() && self.mean_delay().is_unbounded()
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        match key {
            PDT_GREATER_THAN => self.pdt_greater_than,
            PDT_LESS_THAN_OR_EQUAL_TO => self.pdt_less_than_or_equal_to,
            MEAN_DELAY_GREATER_THAN => self.mean_delay_greater_than,
            MEAN_DELAY_LESS_THAN_OR_EQUAL_TO => self.mean_delay_less_than_or_equal_to,
            _ => None,
        }
    }

    /// Returns false for a key that is not a bound.
    pub fn set(&mut self, key: &str, value: Option<i64>) -> bool {
        let slot = match key {
            PDT_GREATER_THAN => &mut self.pdt_greater_than,
            PDT_LESS_THAN_OR_EQUAL_TO => &mut self.pdt_less_than_or_equal_to,
            MEAN_DELAY_GREATER_THAN => &mut self.mean_delay_greater_than,
            MEAN_DELAY_LESS_THAN_OR_EQUAL_TO => &mut self.mean_delay_less_than_or_equal_to,
            _ => return false,
        };
        *slot = value;
        true
    }

    /// Clears the bounds named in `keys` (those factored into common params).
    pub fn without(mut self, keys: &[&str]) -> Self {
        for key in keys {
            self.set(key, None);
        }
        self
    }

    /// Writes every bound onto `conditions`, clearing the ones that are unset.
    pub fn write_to(&self, conditions: &mut ConditionSet) {
        conditions.pdt_greater_than = self.pdt_greater_than;
        conditions.pdt_less_than_or_equal_to = self.pdt_less_than_or_equal_to;
        conditions.mean_delay_greater_than = self.mean_delay_greater_than;
        conditions.mean_delay_less_than_or_equal_to = self.mean_delay_less_than_or_equal_to;
    }

    /// Overlays the set bounds onto `conditions`, leaving the others alone.
    pub fn overlay_onto(&self, conditions: &mut ConditionSet) {
        let mut merged = conditions.bounds();
        for key in BOUND_KEYS {
            if let Some(v) = self.get(key) {
                merged.set(key, Some(v));
            }
        }
        merged.write_to(conditions);
    }

    /// Bounds equal across every item; a bound that differs anywhere is unset.
    pub fn shared(items: impl IntoIterator<Item = Bounds>) -> Bounds {
        let mut iter = items.into_iter();
        let Some(mut shared) = iter.next() else {
            return Bounds::default();
        };
        for other in iter {
            for key in BOUND_KEYS {
                if shared.get(key) != other.get(key) {
                    shared.set(key, None);
                }
            }
        }
        shared
    }

    /// Sort key with unbounded lower ends first and unbounded upper ends last.
    pub fn sort_key(&self) -> (i64, i64, i64, i64) {
        (
            self.pdt().lower(),
            self.pdt().upper(),
            self.mean_delay().lower(),
            self.mean_delay().upper(),
        )
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(pdt) = self.pdt().describe() {
            parts.push(format!("PDT {}", pdt));
        }
        if let Some(mean_delay) = self.mean_delay().describe() {
            parts.push(format!("Mean Delay {}", mean_delay));
        }
        if parts.is_empty() {
            "Default".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Human label such as `PDT 18-23, Mean Delay >4`, or `Default`.
pub fn describe_range(conditions: &ConditionSet) -> String {
    conditions.bounds().describe()
}

fn describe_params(params: &BTreeMap<String, String>) -> Vec<String> {
    let mut parts = Vec::new();
    for key in [DELIVERY_OPTION, DELIVERY_MODE, MARKETPLACE, VERTICAL_TYPES] {
        let Some(value) = params.get(key) else {
            continue;
        };
        parts.push(match key {
            MARKETPLACE if value == "true" => "Marketplace".to_string(),
            MARKETPLACE => "Non-marketplace".to_string(),
            VERTICAL_TYPES if value == ANY_VERTICAL => "All verticals".to_string(),
            VERTICAL_TYPES => split_verticals(value).join("+"),
            _ => value.clone(),
        });
    }
    for (key, value) in params {
        let listed = [DELIVERY_OPTION, DELIVERY_MODE, MARKETPLACE, VERTICAL_TYPES].contains(&key.as_str());
        if !listed && !BOUND_KEYS.contains(&key.as_str()) {
            parts.push(format!("{}={}", key, value));
        }
    }
    parts
}

/// Deterministic group title.
///
/// Groups without any condition are `Default <Section>`; otherwise the
/// section label is followed by the range description and the common
/// parameter values.
pub fn derive_title(
    section: SectionType,
    common_params: &BTreeMap<String, String>,
    has_conditions: bool,
    shared: &Bounds,
) -> String {
    if !has_conditions && common_params.is_empty() {
        return format!("Default {}", section.label());
    }
    let range = (!shared.is_unbounded()).then(|| shared.describe());
    let params = describe_params(common_params);
    match (range, params.is_empty()) {
        (Some(range), true) => format!("{} {}", section.label(), range),
        (Some(range), false) => format!("{} {} ({})", section.label(), range, params.join(", ")),
        (None, false) => format!("{} ({})", section.label(), params.join(", ")),
        (None, true) => format!("{} Default", section.label()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_coerces_marketplace_and_verticals() {
        let raw = json!({
            "marketplace": "TRUE",
            "vertical_types": "restaurants",
            "delivery_mode": "pickup",
            "pdt_less_than_or_equal_to": "23",
            "zone": "north"
        });

        let conditions = normalize_conditions(&raw).unwrap();
        assert_eq!(conditions.marketplace, Some(true));
        assert_eq!(conditions.vertical_types, Some(vec!["restaurants".to_string()]));
        assert_eq!(conditions.delivery_mode, Some(DeliveryMode::Pickup));
        assert_eq!(conditions.pdt_less_than_or_equal_to, Some(23));
        assert_eq!(conditions.extra.get("zone"), Some(&json!("north")));
    }

    #[test]
    fn test_normalize_rejects_non_mapping() {
        let err = normalize_conditions(&json!(["a"])).unwrap_err();
        assert_eq!(err, ConditionError::NotAMapping("sequence".to_string()));
    }

    #[test]
    fn test_normalize_treats_null_as_absent() {
        let conditions = normalize_conditions(&json!({"marketplace": null})).unwrap();
        assert!(conditions.is_empty());
    }

    #[test]
    fn test_grouping_key_three_shapes_are_distinct() {
        let explicit_false = ConditionSet {
            marketplace: Some(false),
            ..ConditionSet::default()
        };
        let empty = ConditionSet::default();

        let none = grouping_key(None, None, RULE_PARAMS);
        let option_only = grouping_key(Some("standard"), None, RULE_PARAMS);
        let explicit = grouping_key(None, Some(&explicit_false), RULE_PARAMS);
        let explicit_empty = grouping_key(None, Some(&empty), RULE_PARAMS);

        assert_eq!(none, "conditions:none");
        assert_eq!(option_only, "delivery_option:STANDARD|conditions:delivery_option_only");
        assert_eq!(explicit, "marketplace:false");
        assert_eq!(explicit_empty, "conditions:empty");
        assert_ne!(none, explicit_empty);
    }

    #[test]
    fn test_grouping_key_renders_params_in_canonical_order() {
        let conditions = ConditionSet {
            vertical_types: Some(vec!["restaurants".into(), "groceries".into()]),
            delivery_mode: Some(DeliveryMode::Delivery),
            marketplace: Some(true),
            ..ConditionSet::default()
        };
        let key = grouping_key(Some("Express"), Some(&conditions), RULE_PARAMS);
        assert_eq!(
            key,
            "delivery_option:EXPRESS|delivery_mode:DELIVERY|marketplace:true|vertical_types:restaurants,groceries"
        );
    }

    #[test]
    fn test_empty_verticals_render_as_any_and_parse_back() {
        let conditions = ConditionSet {
            vertical_types: Some(Vec::new()),
            ..ConditionSet::default()
        };
        let params = common_params(None, Some(&conditions), RULE_PARAMS);
        assert_eq!(params.get(VERTICAL_TYPES).map(String::as_str), Some(ANY_VERTICAL));

        let rebuilt = ConditionSet::from_params(&params).unwrap();
        assert_eq!(rebuilt.vertical_types, Some(Vec::new()));
    }

    #[test]
    fn test_verticals_containing_commas_survive_common_params() {
        let conditions = ConditionSet {
            vertical_types: Some(vec!["a,b".into(), "c\\d".into(), "e".into()]),
            ..ConditionSet::default()
        };
        let params = common_params(None, Some(&conditions), RULE_PARAMS);
        assert_eq!(params.get(VERTICAL_TYPES).map(String::as_str), Some("a\\,b,c\\\\d,e"));

        let rebuilt = ConditionSet::from_params(&params).unwrap();
        assert_eq!(rebuilt.vertical_types, conditions.vertical_types);
        assert_eq!(split_verticals("restaurants, groceries"), vec!["restaurants", "groceries"]);
    }

    #[test]
    fn test_out_of_range_bound_is_rejected() {
        let err = normalize_conditions(&json!({"pdt_greater_than": 1e20})).unwrap_err();
        assert!(matches!(err, ConditionError::InvalidValue { ref key, .. } if key == PDT_GREATER_THAN));

        let conditions = normalize_conditions(&json!({"pdt_greater_than": 18.0})).unwrap();
        assert_eq!(conditions.pdt_greater_than, Some(18));
    }

    #[test]
    fn test_display_format_params_include_pdt_upper_bound() {
        let conditions = ConditionSet {
            pdt_less_than_or_equal_to: Some(30),
            pdt_greater_than: Some(10),
            ..ConditionSet::default()
        };
        let params = common_params(None, Some(&conditions), DISPLAY_FORMAT_PARAMS);
        assert_eq!(params.get(PDT_LESS_THAN_OR_EQUAL_TO).map(String::as_str), Some("30"));
        assert!(!params.contains_key(PDT_GREATER_THAN));
    }

    #[test]
    fn test_describe_range() {
        let conditions = ConditionSet {
            pdt_greater_than: Some(18),
            pdt_less_than_or_equal_to: Some(23),
            mean_delay_greater_than: Some(4),
            ..ConditionSet::default()
        };
        assert_eq!(describe_range(&conditions), "PDT 18-23, Mean Delay >4");

        let upper_only = ConditionSet {
            pdt_less_than_or_equal_to: Some(13),
            ..ConditionSet::default()
        };
        assert_eq!(describe_range(&upper_only), "PDT <=13");
        assert_eq!(describe_range(&ConditionSet::default()), "Default");
    }

    #[test]
    fn test_interval_adjacency_is_not_overlap() {
        let a = Interval::new(Some(0), Some(18));
        let b = Interval::new(Some(18), Some(23));
        assert!(a.is_adjacent_to(&b));
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));

        let c = Interval::new(Some(10), Some(30));
        assert!(Interval::new(Some(0), Some(23)).overlaps(&c));
        assert!(Interval::default().overlaps(&c));
    }

    #[test]
    fn test_shared_bounds_drop_differences() {
        let a = Bounds {
            pdt_greater_than: Some(18),
            pdt_less_than_or_equal_to: Some(23),
            mean_delay_greater_than: Some(4),
            ..Bounds::default()
        };
        let b = Bounds {
            mean_delay_greater_than: Some(6),
            ..a
        };
        let shared = Bounds::shared([a, b]);
        assert_eq!(shared.pdt_greater_than, Some(18));
        assert_eq!(shared.mean_delay_greater_than, None);
    }

    #[test]
    fn test_derive_title_variants() {
        let mut params = BTreeMap::new();
        assert_eq!(
            derive_title(SectionType::Capping, &params, false, &Bounds::default()),
            "Default Capping"
        );

        params.insert(DELIVERY_OPTION.to_string(), "STANDARD".to_string());
        params.insert(VERTICAL_TYPES.to_string(), "restaurants".to_string());
        let shared = Bounds {
            pdt_greater_than: Some(18),
            pdt_less_than_or_equal_to: Some(23),
            ..Bounds::default()
        };
        assert_eq!(
            derive_title(SectionType::Ranges, &params, true, &shared),
            "Ranges PDT 18-23 (STANDARD, restaurants)"
        );
    }
}
