// In-memory group model and its CRUD operations.
//
// Design Principles:
// 1. Groups are a derived index over flat sections; they are rebuilt from a
//    Config on load and flattened back after every mutation (write-through)
// 2. Grouping uses the same key function as the import reconciler
// 3. Identifiers come from one monotonic counter owned by the store and are
//    never reused
// 4. Operations on unknown ids are no-ops that report failure through their
//    return value
//
// Capping rules are a tagged union; switching a rule's variant resets its
// payload to the new variant's defaults.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

use crate::conditions::{
    common_params, derive_title, grouping_key, grouping_params, normalize_delivery_option, Bounds,
    ConditionSet, DELIVERY_OPTION, KNOWN_CONDITION_KEYS,
};
use crate::config_model::{
    Config, DisplayFormat, EntryPayload, FlatEntry, MetadataField, RangeCap, RoundingStrategy,
    Section, SectionType, SingleCap,
};

// ============================================================================
// Identifiers
// ============================================================================

/// Group identifier, unique for the lifetime of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Rule identifier, unique for the lifetime of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule-{}", self.0)
    }
}

/// Monotonic id source shared by groups and rules.
#[derive(Debug, Clone, Default)]
pub struct IdCounter {
    next: u64,
}

impl IdCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    fn bump(&mut self) -> u64 {
        if self.next == 0 {
            self.next = 1;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn next_group(&mut self) -> GroupId {
        GroupId(self.bump())
    }

    pub fn next_rule(&mut self) -> RuleId {
        RuleId(self.bump())
    }
}

// ============================================================================
// Rules and groups
// ============================================================================

/// Capping rule shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CappingRule {
    Single {
        min: i64,
        max: i64,
    },
    Ranges {
        #[serde(rename = "minLowerBound")]
        min_lower_bound: i64,
        #[serde(rename = "minUpperBound")]
        min_upper_bound: i64,
        #[serde(rename = "maxLowerBound")]
        max_lower_bound: i64,
        #[serde(rename = "maxUpperBound")]
        max_upper_bound: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CappingKind {
    Single,
    Ranges,
}

impl CappingRule {
    pub fn default_for(kind: CappingKind) -> Self {
        match kind {
            CappingKind::Single => CappingRule::Single { min: 0, max: 0 },
            CappingKind::Ranges => CappingRule::Ranges {
                min_lower_bound: 0,
                min_upper_bound: 0,
                max_lower_bound: 0,
                max_upper_bound: 0,
            },
        }
    }

    pub fn kind(&self) -> CappingKind {
        match self {
            CappingRule::Single { .. } => CappingKind::Single,
            CappingRule::Ranges { .. } => CappingKind::Ranges,
        }
    }
}

impl From<SingleCap> for CappingRule {
    fn from(cap: SingleCap) -> Self {
        CappingRule::Single {
            min: cap.min,
            max: cap.max,
        }
    }
}

impl From<RangeCap> for CappingRule {
    fn from(cap: RangeCap) -> Self {
        CappingRule::Ranges {
            min_lower_bound: cap.min_lower_bound,
            min_upper_bound: cap.min_upper_bound,
            max_lower_bound: cap.max_lower_bound,
            max_upper_bound: cap.max_upper_bound,
        }
    }
}

/// Section-specific content of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "section", rename_all = "snake_case")]
pub enum RuleBody {
    DisplayFormat {
        format: DisplayFormat,
    },
    Ranges {
        #[serde(rename = "lowerBound")]
        lower_bound: i64,
        #[serde(rename = "upperBound")]
        upper_bound: i64,
    },
    Capping {
        cap: CappingRule,
    },
    Rounding {
        strategy: RoundingStrategy,
    },
}

impl RuleBody {
    pub fn default_for(section: SectionType) -> Self {
        match section {
            SectionType::DisplayFormat => RuleBody::DisplayFormat {
                format: DisplayFormat::Range,
            },
            SectionType::Ranges => RuleBody::Ranges {
                lower_bound: 0,
                upper_bound: 0,
            },
            SectionType::Capping => RuleBody::Capping {
                cap: CappingRule::default_for(CappingKind::Single),
            },
            SectionType::Rounding => RuleBody::Rounding {
                strategy: RoundingStrategy::Nearest,
            },
        }
    }

    pub fn section(&self) -> SectionType {
        match self {
            RuleBody::DisplayFormat { .. } => SectionType::DisplayFormat,
            RuleBody::Ranges { .. } => SectionType::Ranges,
            RuleBody::Capping { .. } => SectionType::Capping,
            RuleBody::Rounding { .. } => SectionType::Rounding,
        }
    }
}

/// One behavioral entry inside a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: RuleId,
    pub body: RuleBody,
    /// Rule-level numeric overrides, merged over the group's common params.
    #[serde(default)]
    pub bounds: Bounds,
    /// Unrecognized condition keys carried from the source entry.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub passthrough: Map<String, Value>,
}

impl Rule {
    pub fn new(id: RuleId, body: RuleBody) -> Self {
        Self {
            id,
            body,
            bounds: Bounds::default(),
            passthrough: Map::new(),
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Ordering used inside ranges groups.
    fn ranges_sort_key(&self) -> (i64, i64, i64, i64, i64, i64) {
        let (pdt_lo, pdt_hi, md_lo, md_hi) = self.bounds.sort_key();
        let (lower, upper) = match self.body {
            RuleBody::Ranges {
                lower_bound,
                upper_bound,
            } => (lower_bound, upper_bound),
            _ => (0, 0),
        };
        (pdt_lo, pdt_hi, md_lo, md_hi, lower, upper)
    }
}

/// Same-kind rules sharing common parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub section: SectionType,
    pub title: String,
    pub common_params: BTreeMap<String, String>,
    /// Whether entries of this group carry a `conditions` mapping at all.
    pub has_conditions: bool,
    pub rules: Vec<Rule>,
}

impl Group {
    pub fn rule(&self, rule_id: RuleId) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    pub fn rule_index(&self, rule_id: RuleId) -> Option<usize> {
        self.rules.iter().position(|r| r.id == rule_id)
    }

    /// Derived title for the group's current parameters and rules.
    pub fn derived_title(&self) -> String {
        let shared = Bounds::shared(self.rules.iter().map(|r| r.bounds));
        let mut effective = shared;
        for (key, value) in &self.common_params {
            if let Ok(v) = value.parse::<i64>() {
                effective.set(key, Some(v));
            }
        }
        derive_title(self.section, &self.common_params, self.has_conditions, &effective)
    }

    /// Conditions for one rule: common params, then rule bounds, then
    /// passthrough keys.
    fn conditions_for(&self, rule: &Rule) -> Option<ConditionSet> {
        let mut conditions = ConditionSet::new();
        for (key, value) in &self.common_params {
            if key == DELIVERY_OPTION {
                continue;
            }
            if let Err(e) = conditions.set_param(key, value) {
                warn!("Skipping common parameter {}={} of {}: {}", key, value, self.id, e);
            }
        }
        rule.bounds.overlay_onto(&mut conditions);
        for (key, value) in &rule.passthrough {
            if !KNOWN_CONDITION_KEYS.contains(&key.as_str()) && !conditions.extra.contains_key(key) {
                conditions.extra.insert(key.clone(), value.clone());
            }
        }
        if !self.has_conditions && conditions.is_empty() {
            None
        } else {
            Some(conditions)
        }
    }

    fn delivery_option(&self) -> Option<String> {
        self.common_params.get(DELIVERY_OPTION).cloned()
    }

    /// Flat entries for this group, each carrying the group title.
    pub fn to_entries(&self) -> Vec<FlatEntry> {
        let mut entries = Vec::new();
        if self.section == SectionType::Capping {
            // At most one cap of each variant per entry; caps only share an
            // entry when their conditions are identical.
            let mut open: Vec<(Option<ConditionSet>, Option<SingleCap>, Option<RangeCap>)> = Vec::new();
            for rule in &self.rules {
                let RuleBody::Capping { cap } = rule.body else {
                    continue;
                };
                let conditions = self.conditions_for(rule);
                let free = open.iter().position(|(c, single, ranges)| {
                    c == &conditions
                        && match cap.kind() {
                            CappingKind::Single => single.is_none(),
                            CappingKind::Ranges => ranges.is_none(),
                        }
                });
                let position = match free {
                    Some(position) => position,
                    None => {
                        open.push((conditions, None, None));
                        open.len() - 1
                    }
                };
                let slot = &mut open[position];
                match cap {
                    CappingRule::Single { min, max } => slot.1 = Some(SingleCap { min, max }),
                    CappingRule::Ranges {
                        min_lower_bound,
                        min_upper_bound,
                        max_lower_bound,
                        max_upper_bound,
                    } => {
                        slot.2 = Some(RangeCap {
                            min_lower_bound,
                            min_upper_bound,
                            max_lower_bound,
                            max_upper_bound,
                        })
                    }
                }
            }
            for (conditions, single, ranges) in open {
                entries.push(FlatEntry {
                    title: Some(self.title.clone()),
                    delivery_option: self.delivery_option(),
                    conditions,
                    payload: EntryPayload::Capping { single, ranges },
                });
            }
            return entries;
        }

        for rule in &self.rules {
            let payload = match rule.body {
                RuleBody::DisplayFormat { format } => EntryPayload::DisplayFormat { format },
                RuleBody::Ranges {
                    lower_bound,
                    upper_bound,
                } => EntryPayload::Ranges {
                    lower_bound,
                    upper_bound,
                },
                RuleBody::Rounding { strategy } => EntryPayload::Rounding { strategy },
                RuleBody::Capping { .. } => continue,
            };
            entries.push(FlatEntry {
                title: Some(self.title.clone()),
                delivery_option: self.delivery_option(),
                conditions: self.conditions_for(rule),
                payload,
            });
        }
        entries
    }
}

/// Ordered collection of groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupIndex {
    groups: Vec<Group>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups(groups: Vec<Group>) -> Self {
        Self { groups }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    pub fn as_slice(&self) -> &[Group] {
        &self.groups
    }

    pub fn get(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    fn get_mut(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    fn position(&self, id: GroupId) -> Option<usize> {
        self.groups.iter().position(|g| g.id == id)
    }

    pub fn of_section(&self, section: SectionType) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(move |g| g.section == section)
    }

    /// Flattens the groups back into one section per kind, in order of the
    /// first group of each kind.
    pub fn to_sections(&self) -> Vec<Section> {
        let mut sections: Vec<Section> = Vec::new();
        for group in &self.groups {
            let entries = group.to_entries();
            match sections.iter_mut().find(|s| s.kind == group.section) {
                Some(section) => section.entries.extend(entries),
                None => sections.push(Section::with_entries(group.section, entries)),
            }
        }
        sections
    }
}

// ============================================================================
// Rebuild: flat sections -> groups
// ============================================================================

struct GroupBuilder<'a> {
    common_params: BTreeMap<String, String>,
    has_conditions: bool,
    entries: Vec<&'a FlatEntry>,
}

fn rules_from_entry(entry: &FlatEntry, param_keys: &[&str], ids: &mut IdCounter) -> Vec<Rule> {
    let (bounds, passthrough) = match &entry.conditions {
        Some(conditions) => (conditions.bounds().without(param_keys), conditions.extra.clone()),
        None => (Bounds::default(), Map::new()),
    };
    let make = |ids: &mut IdCounter, body: RuleBody| Rule {
        id: ids.next_rule(),
        body,
        bounds,
        passthrough: passthrough.clone(),
    };

    match &entry.payload {
        EntryPayload::DisplayFormat { format } => {
            vec![make(ids, RuleBody::DisplayFormat { format: *format })]
        }
        EntryPayload::Ranges {
            lower_bound,
            upper_bound,
        } => vec![make(
            ids,
            RuleBody::Ranges {
                lower_bound: *lower_bound,
                upper_bound: *upper_bound,
            },
        )],
        EntryPayload::Capping { single, ranges } => {
            let mut rules = Vec::new();
            if let Some(single) = single {
                rules.push(make(ids, RuleBody::Capping { cap: (*single).into() }));
            }
            if let Some(ranges) = ranges {
                rules.push(make(ids, RuleBody::Capping { cap: (*ranges).into() }));
            }
            if rules.is_empty() {
                warn!("Capping entry without single or ranges cap carries no rule");
            }
            rules
        }
        EntryPayload::Rounding { strategy } => {
            vec![make(ids, RuleBody::Rounding { strategy: *strategy })]
        }
    }
}

/// The `_title` the titled entries of a group agree on, if any. Untitled
/// entries don't count (a YAML comment only titles the first entry). Entries
/// titled apart (e.g. per Mean-Delay pair) leave the group to a derived title.
fn stored_title(entries: &[&FlatEntry]) -> Option<String> {
    let mut titles = entries
        .iter()
        .filter_map(|e| e.title.as_deref())
        .filter(|t| !t.trim().is_empty());
    let title = titles.next()?;
    titles.all(|t| t == title).then(|| title.to_string())
}

/// Partitions the flat sections of `config` into groups.
///
/// Entries are keyed by [`grouping_key`] with the section's parameter set;
/// ranges entries are further split by their exact PDT bound pair and their
/// rules sorted by bounds then by lower/upper bound. Groups appear in
/// first-seen order.
pub fn rebuild_from_config(config: &Config, ids: &mut IdCounter) -> GroupIndex {
    let mut groups = Vec::new();

    for kind in config.section_kinds() {
        let param_keys = grouping_params(kind);
        let mut builders: Vec<GroupBuilder> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for entry in config.entries_of(kind) {
            let mut key = grouping_key(
                entry.delivery_option.as_deref(),
                entry.conditions.as_ref(),
                param_keys,
            );
            if kind == SectionType::Ranges {
                let pdt = entry.conditions.as_ref().map(|c| c.bounds().pdt()).unwrap_or_default();
                key.push_str(&format!("|pdt:{:?}:{:?}", pdt.greater_than, pdt.less_than_or_equal_to));
            }
            let index = *by_key.entry(key).or_insert_with(|| {
                builders.push(GroupBuilder {
                    common_params: common_params(
                        entry.delivery_option.as_deref(),
                        entry.conditions.as_ref(),
                        param_keys,
                    ),
                    has_conditions: entry.conditions.is_some(),
                    entries: Vec::new(),
                });
                builders.len() - 1
            });
            builders[index].entries.push(entry);
        }

        for builder in builders {
            let mut rules: Vec<Rule> = builder
                .entries
                .iter()
                .flat_map(|e| rules_from_entry(e, param_keys, ids))
                .collect();
            if kind == SectionType::Ranges {
                rules.sort_by_key(Rule::ranges_sort_key);
            }
            let mut group = Group {
                id: ids.next_group(),
                section: kind,
                title: String::new(),
                common_params: builder.common_params,
                has_conditions: builder.has_conditions,
                rules,
            };
            group.title = stored_title(&builder.entries).unwrap_or_else(|| group.derived_title());
            groups.push(group);
        }
    }

    GroupIndex::from_groups(groups)
}

/// Inverse of [`rebuild_from_config`]: one section per kind with every
/// group's rules flattened and titled.
pub fn to_config(index: &GroupIndex) -> Vec<Section> {
    index.to_sections()
}

// ============================================================================
// Persistence seam
// ============================================================================

/// Persistence errors
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to serialize configuration: {0}")]
    Serialization(String),

    #[error("failed to write configuration: {0}")]
    Write(String),
}

/// Write-through target for every committed mutation.
pub trait ConfigSink {
    fn persist(&mut self, config: &Config) -> Result<(), PersistError>;
}

// ============================================================================
// Mutations
// ============================================================================

/// Editable rule fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum RuleUpdate {
    Format(DisplayFormat),
    LowerBound(i64),
    UpperBound(i64),
    /// Sets or clears one of the four numeric bounds by condition key.
    PdtGreaterThan(Option<i64>),
    PdtLessThanOrEqualTo(Option<i64>),
    MeanDelayGreaterThan(Option<i64>),
    MeanDelayLessThanOrEqualTo(Option<i64>),
    /// Switches the capping variant; the payload resets to the new variant's
    /// defaults.
    CappingType(CappingKind),
    CappingValue(CappingField, i64),
    Strategy(RoundingStrategy),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CappingField {
    Min,
    Max,
    MinLowerBound,
    MinUpperBound,
    MaxLowerBound,
    MaxUpperBound,
}

fn apply_update(rule: &mut Rule, update: RuleUpdate) -> bool {
    match (update, &mut rule.body) {
        (RuleUpdate::Format(new), RuleBody::DisplayFormat { format }) => *format = new,
        (RuleUpdate::LowerBound(v), RuleBody::Ranges { lower_bound, .. }) => *lower_bound = v,
        (RuleUpdate::UpperBound(v), RuleBody::Ranges { upper_bound, .. }) => *upper_bound = v,
        (RuleUpdate::PdtGreaterThan(v), _) => rule.bounds.pdt_greater_than = v,
        (RuleUpdate::PdtLessThanOrEqualTo(v), _) => rule.bounds.pdt_less_than_or_equal_to = v,
        (RuleUpdate::MeanDelayGreaterThan(v), _) => rule.bounds.mean_delay_greater_than = v,
        (RuleUpdate::MeanDelayLessThanOrEqualTo(v), _) => {
            rule.bounds.mean_delay_less_than_or_equal_to = v
        }
        (RuleUpdate::CappingType(kind), RuleBody::Capping { cap }) => {
            if cap.kind() != kind {
                *cap = CappingRule::default_for(kind);
            }
        }
        (RuleUpdate::CappingValue(field, v), RuleBody::Capping { cap }) => {
            let slot = match (field, cap) {
                (CappingField::Min, CappingRule::Single { min, .. }) => min,
                (CappingField::Max, CappingRule::Single { max, .. }) => max,
                (CappingField::MinLowerBound, CappingRule::Ranges { min_lower_bound, .. }) => {
                    min_lower_bound
                }
                (CappingField::MinUpperBound, CappingRule::Ranges { min_upper_bound, .. }) => {
                    min_upper_bound
                }
                (CappingField::MaxLowerBound, CappingRule::Ranges { max_lower_bound, .. }) => {
                    max_lower_bound
                }
                (CappingField::MaxUpperBound, CappingRule::Ranges { max_upper_bound, .. }) => {
                    max_upper_bound
                }
                _ => return false,
            };
            *slot = v;
        }
        (RuleUpdate::Strategy(new), RuleBody::Rounding { strategy }) => *strategy = new,
        _ => return false,
    }
    true
}

/// Owner of the configuration and its group index.
///
/// Every successful mutation re-serializes the groups into
/// `config.sections` and hands the config to the sink, if any. Sink failures
/// are logged and never roll back the in-memory model.
pub struct RuleStore {
    config: Config,
    index: GroupIndex,
    ids: IdCounter,
    sink: Option<Box<dyn ConfigSink>>,
}

impl fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleStore")
            .field("config", &self.config)
            .field("index", &self.index)
            .field("ids", &self.ids)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl RuleStore {
    /// Loads a config without persisting it.
    pub fn new(config: Config) -> Self {
        let mut store = Self {
            config: Config::default(),
            index: GroupIndex::new(),
            ids: IdCounter::new(),
            sink: None,
        };
        store.load(config);
        store
    }

    pub fn with_sink(mut self, sink: Box<dyn ConfigSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn groups(&self) -> &GroupIndex {
        &self.index
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.index.get(id)
    }

    fn load(&mut self, config: Config) {
        self.index = rebuild_from_config(&config, &mut self.ids);
        self.config = config;
        self.config.sections = to_config(&self.index);
        info!(
            "Rebuilt {} groups from {} entries (variant {})",
            self.index.len(),
            self.config.entry_count(),
            self.config.variant
        );
    }

    /// Replaces the whole model, e.g. after a confirmed import. Group ids are
    /// fresh afterwards.
    pub fn replace_config(&mut self, config: Config) {
        self.load(config);
        self.persist();
    }

    fn commit(&mut self) {
        self.config.sections = to_config(&self.index);
        self.persist();
    }

    fn persist(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.persist(&self.config) {
                warn!("Persisting configuration failed: {}", e);
            }
        }
    }

    pub fn set_metadata(&mut self, field: MetadataField, value: impl Into<String>) {
        field.set(&mut self.config, value.into());
        self.persist();
    }

    /// Creates a group. Invalid parameter values are dropped with a warning.
    pub fn add_group(
        &mut self,
        section: SectionType,
        common_params: BTreeMap<String, String>,
        title: Option<String>,
    ) -> GroupId {
        let mut params = BTreeMap::new();
        for (key, value) in common_params {
            match canonical_param(&key, &value) {
                Some(canonical) => {
                    params.insert(key, canonical);
                }
                None => warn!("Dropping invalid common parameter {}={}", key, value),
            }
        }
        let has_conditions = params.keys().any(|k| k != DELIVERY_OPTION);
        let mut group = Group {
            id: self.ids.next_group(),
            section,
            title: String::new(),
            common_params: params,
            has_conditions,
            rules: Vec::new(),
        };
        group.title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| group.derived_title());
        let id = group.id;
        debug!("Added {} group {} ({})", section, id, group.title);
        self.index.groups.push(group);
        self.commit();
        id
    }

    /// Deep copy placed right after the original, with fresh ids.
    pub fn clone_group(&mut self, id: GroupId) -> Option<GroupId> {
        let position = self.index.position(id)?;
        let mut copy = self.index.groups[position].clone();
        copy.id = self.ids.next_group();
        copy.title = format!("Copy of {}", copy.title);
        for rule in &mut copy.rules {
            rule.id = self.ids.next_rule();
        }
        let new_id = copy.id;
        self.index.groups.insert(position + 1, copy);
        debug!("Cloned {} into {}", id, new_id);
        self.commit();
        Some(new_id)
    }

    pub fn delete_group(&mut self, id: GroupId) -> bool {
        let Some(position) = self.index.position(id) else {
            return false;
        };
        self.index.groups.remove(position);
        debug!("Deleted {}", id);
        self.commit();
        true
    }

    /// Sets (`Some`) or removes (`None` or blank) one common parameter.
    /// Returns false for an unknown group or a value that does not parse for
    /// a recognized key.
    pub fn update_group_common_param(&mut self, id: GroupId, key: &str, value: Option<&str>) -> bool {
        let value = value.map(str::trim).filter(|v| !v.is_empty());
        let canonical = match value {
            Some(v) => match canonical_param(key, v) {
                Some(canonical) => Some(canonical),
                None => return false,
            },
            None => None,
        };
        let Some(group) = self.index.get_mut(id) else {
            return false;
        };
        match canonical {
            Some(stored) => {
                group.common_params.insert(key.to_string(), stored);
                if key != DELIVERY_OPTION {
                    group.has_conditions = true;
                }
            }
            None => {
                group.common_params.remove(key);
            }
        }
        debug!("Updated {} param {}", id, key);
        self.commit();
        true
    }

    /// Sets a custom title, or re-derives it when `title` is `None`.
    pub fn rename_group(&mut self, id: GroupId, title: Option<String>) -> bool {
        let Some(group) = self.index.get_mut(id) else {
            return false;
        };
        group.title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| group.derived_title());
        self.commit();
        true
    }

    /// Appends a rule with the section's defaults.
    pub fn add_rule(&mut self, group_id: GroupId) -> Option<RuleId> {
        let section = self.index.get(group_id)?.section;
        self.insert_rule(group_id, RuleBody::default_for(section), Bounds::default())
    }

    /// Appends a rule with the given content. Fails when the body belongs to
    /// another section.
    pub fn insert_rule(&mut self, group_id: GroupId, body: RuleBody, bounds: Bounds) -> Option<RuleId> {
        let group = self.index.get(group_id)?;
        if group.section != body.section() {
            return None;
        }
        let rule = Rule::new(self.ids.next_rule(), body).with_bounds(bounds);
        let rule_id = rule.id;
        self.index.get_mut(group_id)?.rules.push(rule);
        debug!("Added {} to {}", rule_id, group_id);
        self.commit();
        Some(rule_id)
    }

    pub fn update_rule(&mut self, group_id: GroupId, rule_id: RuleId, update: RuleUpdate) -> bool {
        let Some(rule) = self
            .index
            .get_mut(group_id)
            .and_then(|g| g.rules.iter_mut().find(|r| r.id == rule_id))
        else {
            return false;
        };
        if !apply_update(rule, update) {
            return false;
        }
        debug!("Updated {} in {}: {:?}", rule_id, group_id, update);
        self.commit();
        true
    }

    pub fn delete_rule(&mut self, group_id: GroupId, rule_id: RuleId) -> bool {
        let Some(group) = self.index.get_mut(group_id) else {
            return false;
        };
        let Some(position) = group.rule_index(rule_id) else {
            return false;
        };
        group.rules.remove(position);
        debug!("Deleted {} from {}", rule_id, group_id);
        self.commit();
        true
    }
}

/// Canonical form of a common parameter value, or `None` when it does not
/// parse for its key.
fn canonical_param(key: &str, value: &str) -> Option<String> {
    if key == DELIVERY_OPTION {
        let option = normalize_delivery_option(value);
        return (!option.is_empty()).then_some(option);
    }
    let mut conditions = ConditionSet::new();
    conditions.set_param(key, value).ok()?;
    conditions.param_value(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{DeliveryMode, MARKETPLACE, VERTICAL_TYPES};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ranges_entry(gt: Option<i64>, lte: Option<i64>, lower: i64, upper: i64) -> FlatEntry {
        FlatEntry::new(EntryPayload::Ranges {
            lower_bound: lower,
            upper_bound: upper,
        })
        .with_delivery_option("STANDARD")
        .with_conditions(ConditionSet {
            vertical_types: Some(vec!["restaurants".into()]),
            pdt_greater_than: gt,
            pdt_less_than_or_equal_to: lte,
            ..ConditionSet::default()
        })
    }

    fn config_with(sections: Vec<Section>) -> Config {
        Config {
            sections,
            ..Config::default()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        writes: Rc<RefCell<Vec<Config>>>,
    }

    impl ConfigSink for RecordingSink {
        fn persist(&mut self, config: &Config) -> Result<(), PersistError> {
            self.writes.borrow_mut().push(config.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl ConfigSink for FailingSink {
        fn persist(&mut self, _config: &Config) -> Result<(), PersistError> {
            Err(PersistError::Write("disk full".to_string()))
        }
    }

    #[test]
    fn test_rebuild_splits_ranges_by_pdt_pair() {
        let config = config_with(vec![Section::with_entries(
            SectionType::Ranges,
            vec![
                ranges_entry(Some(13), Some(18), 20, 30),
                ranges_entry(None, Some(13), 10, 20),
                ranges_entry(Some(13), Some(18), 15, 25),
            ],
        )]);

        let store = RuleStore::new(config);
        let groups: Vec<&Group> = store.groups().iter().collect();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].rules.len(), 2);
        assert_eq!(groups[0].title, "Ranges PDT 13-18 (STANDARD, restaurants)");
        // Sorted by lower bound within the same window.
        assert_eq!(
            groups[0].rules[0].body,
            RuleBody::Ranges {
                lower_bound: 15,
                upper_bound: 25
            }
        );
        assert_eq!(groups[1].title, "Ranges PDT <=13 (STANDARD, restaurants)");
    }

    #[test]
    fn test_rebuild_prefers_stored_title() {
        let config = config_with(vec![Section::with_entries(
            SectionType::Rounding,
            vec![FlatEntry::new(EntryPayload::Rounding {
                strategy: RoundingStrategy::Floor,
            })
            .with_title("Night rounding")],
        )]);
        let store = RuleStore::new(config);
        assert_eq!(store.groups().as_slice()[0].title, "Night rounding");
    }

    #[test]
    fn test_rebuild_title_from_agreeing_entries_only() {
        let rounding = |strategy| FlatEntry::new(EntryPayload::Rounding { strategy });

        let config = config_with(vec![Section::with_entries(
            SectionType::Rounding,
            vec![rounding(RoundingStrategy::Floor).with_title("Night"), rounding(RoundingStrategy::Ceil)],
        )]);
        assert_eq!(RuleStore::new(config).groups().as_slice()[0].title, "Night");

        let config = config_with(vec![Section::with_entries(
            SectionType::Rounding,
            vec![
                rounding(RoundingStrategy::Floor).with_title("Night"),
                rounding(RoundingStrategy::Ceil).with_title("Day"),
            ],
        )]);
        let store = RuleStore::new(config);
        assert_eq!(store.groups().as_slice()[0].title, "Default Rounding");
        assert!(store.config().sections[0]
            .entries
            .iter()
            .all(|e| e.title.as_deref() == Some("Default Rounding")));
    }

    #[test]
    fn test_unconditioned_group_gets_default_title() {
        let config = config_with(vec![Section::with_entries(
            SectionType::DisplayFormat,
            vec![FlatEntry::new(EntryPayload::DisplayFormat {
                format: DisplayFormat::Exact,
            })],
        )]);
        let store = RuleStore::new(config);
        assert_eq!(store.groups().as_slice()[0].title, "Default Display Format");
        assert_eq!(store.config().sections[0].entries[0].conditions, None);
    }

    #[test]
    fn test_round_trip_preserves_logical_entries() {
        let display = FlatEntry::new(EntryPayload::DisplayFormat {
            format: DisplayFormat::Range,
        })
        .with_conditions(ConditionSet {
            delivery_mode: Some(DeliveryMode::Delivery),
            pdt_less_than_or_equal_to: Some(30),
            mean_delay_greater_than: Some(2),
            ..ConditionSet::default()
        });
        let mut with_extra = ranges_entry(Some(18), Some(23), 30, 40);
        if let Some(c) = with_extra.conditions.as_mut() {
            c.extra.insert("zone".to_string(), Value::from("north"));
        }
        let original = config_with(vec![
            Section::with_entries(SectionType::DisplayFormat, vec![display]),
            Section::with_entries(SectionType::Ranges, vec![with_extra]),
        ]);

        let store = RuleStore::new(original.clone());
        let regenerated = store.config();
        for kind in [SectionType::DisplayFormat, SectionType::Ranges] {
            let before: Vec<&FlatEntry> = original.entries_of(kind).collect();
            let after: Vec<&FlatEntry> = regenerated.entries_of(kind).collect();
            assert_eq!(before.len(), after.len());
            for (b, a) in before.iter().zip(after.iter()) {
                assert!(b.logically_eq(a), "{:?} != {:?}", b, a);
            }
        }
    }

    #[test]
    fn test_capping_entries_collapse_one_variant_each() {
        let mut store = RuleStore::new(Config::default());
        let group = store.add_group(SectionType::Capping, BTreeMap::new(), None);
        store.insert_rule(
            group,
            RuleBody::Capping {
                cap: CappingRule::Single { min: 10, max: 60 },
            },
            Bounds::default(),
        );
        store.insert_rule(
            group,
            RuleBody::Capping {
                cap: CappingRule::default_for(CappingKind::Ranges),
            },
            Bounds::default(),
        );
        store.insert_rule(
            group,
            RuleBody::Capping {
                cap: CappingRule::Single { min: 5, max: 50 },
            },
            Bounds::default(),
        );

        let entries = &store.config().sections[0].entries;
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[0].payload,
            EntryPayload::Capping {
                single: Some(_),
                ranges: Some(_)
            }
        ));
        assert!(matches!(
            entries[1].payload,
            EntryPayload::Capping {
                single: Some(SingleCap { min: 5, max: 50 }),
                ranges: None
            }
        ));

        // Reloading keeps both singles in one group.
        let reloaded = RuleStore::new(store.config().clone());
        assert_eq!(reloaded.groups().len(), 1);
        assert_eq!(reloaded.groups().as_slice()[0].rules.len(), 3);
    }

    #[test]
    fn test_capping_type_change_resets_shape() {
        let mut store = RuleStore::new(Config::default());
        let group = store.add_group(SectionType::Capping, BTreeMap::new(), None);
        let rule = store
            .insert_rule(
                group,
                RuleBody::Capping {
                    cap: CappingRule::Single { min: 10, max: 60 },
                },
                Bounds::default(),
            )
            .unwrap();

        assert!(store.update_rule(group, rule, RuleUpdate::CappingType(CappingKind::Ranges)));
        let body = store.group(group).unwrap().rule(rule).unwrap().body;
        assert_eq!(
            body,
            RuleBody::Capping {
                cap: CappingRule::default_for(CappingKind::Ranges)
            }
        );
        assert!(!store.update_rule(group, rule, RuleUpdate::CappingValue(CappingField::Min, 3)));
        assert!(store.update_rule(
            group,
            rule,
            RuleUpdate::CappingValue(CappingField::MaxUpperBound, 90)
        ));
    }

    #[test]
    fn test_unknown_ids_are_no_ops() {
        let mut store = RuleStore::new(Config::default());
        assert!(!store.delete_group(GroupId(42)));
        assert!(store.clone_group(GroupId(42)).is_none());
        assert!(store.add_rule(GroupId(42)).is_none());
        assert!(!store.update_rule(GroupId(42), RuleId(1), RuleUpdate::LowerBound(1)));
        assert!(!store.update_group_common_param(GroupId(42), MARKETPLACE, Some("true")));

        let group = store.add_group(SectionType::Ranges, BTreeMap::new(), None);
        assert!(!store.delete_rule(group, RuleId(999)));
        assert!(!store.update_rule(group, RuleId(999), RuleUpdate::LowerBound(1)));
    }

    #[test]
    fn test_clone_group_copies_rules_with_fresh_ids() {
        let mut store = RuleStore::new(Config::default());
        let group = store.add_group(SectionType::Ranges, BTreeMap::new(), Some("Lunch".into()));
        let rule = store.add_rule(group).unwrap();

        let copy = store.clone_group(group).unwrap();
        assert_ne!(copy, group);
        let cloned = store.group(copy).unwrap();
        assert_eq!(cloned.title, "Copy of Lunch");
        assert_eq!(cloned.rules.len(), 1);
        assert_ne!(cloned.rules[0].id, rule);
        assert_eq!(store.groups().as_slice()[1].id, copy);
    }

    #[test]
    fn test_ids_are_not_reused_after_delete() {
        let mut store = RuleStore::new(Config::default());
        let first = store.add_group(SectionType::Rounding, BTreeMap::new(), None);
        assert!(store.delete_group(first));
        let second = store.add_group(SectionType::Rounding, BTreeMap::new(), None);
        assert!(second > first);
    }

    #[test]
    fn test_common_param_validation() {
        let mut store = RuleStore::new(Config::default());
        let group = store.add_group(SectionType::DisplayFormat, BTreeMap::new(), None);
        assert!(!store.update_group_common_param(group, "delivery_mode", Some("TELEPORT")));
        assert!(store.update_group_common_param(group, "delivery_mode", Some("pickup")));
        assert!(store.update_group_common_param(group, VERTICAL_TYPES, Some("groceries,pharmacy")));
        store.add_rule(group);

        let entry = &store.config().sections[0].entries[0];
        let conditions = entry.conditions.as_ref().unwrap();
        assert_eq!(conditions.delivery_mode, Some(DeliveryMode::Pickup));
        assert_eq!(
            conditions.vertical_types,
            Some(vec!["groceries".to_string(), "pharmacy".to_string()])
        );

        assert!(store.update_group_common_param(group, "delivery_mode", None));
        assert!(!store.group(group).unwrap().common_params.contains_key("delivery_mode"));
    }

    #[test]
    fn test_every_mutation_writes_through_to_sink() {
        let sink = RecordingSink::default();
        let writes = sink.writes.clone();
        let mut store = RuleStore::new(Config::default()).with_sink(Box::new(sink));

        let group = store.add_group(SectionType::Ranges, BTreeMap::new(), None);
        let rule = store.add_rule(group).unwrap();
        store.update_rule(group, rule, RuleUpdate::UpperBound(45));
        assert!(!store.delete_rule(group, RuleId(12345)));

        let writes = writes.borrow();
        assert_eq!(writes.len(), 3);
        let last = writes.last().unwrap();
        assert_eq!(
            last.sections[0].entries[0].payload,
            EntryPayload::Ranges {
                lower_bound: 0,
                upper_bound: 45
            }
        );
    }

    #[test]
    fn test_sink_failure_keeps_model() {
        let mut store = RuleStore::new(Config::default()).with_sink(Box::new(FailingSink));
        let group = store.add_group(SectionType::Rounding, BTreeMap::new(), None);
        assert!(store.add_rule(group).is_some());
        assert_eq!(store.config().entry_count(), 1);
    }
}
