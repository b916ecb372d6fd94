// Semantic validation over the group index.
//
// This module provides:
// 1. Duplicate group detection (identical common parameters per section)
// 2. Overlapping ranges detection on the PDT x Mean-Delay plane
// 3. Rule cardinality checks for capping and display-format groups
// 4. Required field checks (empty groups, inverted bounds)
//
// The validator is read-only and its findings are advisory: they never block
// a mutation.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::conditions::Bounds;
use crate::config_model::{DisplayFormat, SectionType};
use crate::rule_store::{CappingKind, CappingRule, Group, GroupId, Rule, RuleBody, RuleId};

/// Location of a rule inside the group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRef {
    pub group_id: GroupId,
    pub rule_id: RuleId,
    /// Position of the rule inside its group.
    pub rule_index: usize,
}

impl RuleRef {
    fn of(group: &Group, rule_index: usize) -> Self {
        Self {
            group_id: group.id,
            rule_id: group.rules[rule_index].id,
            rule_index,
        }
    }
}

impl fmt::Display for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rule #{}", self.group_id, self.rule_index + 1)
    }
}

/// Groups that describe the same rule context twice.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DuplicateGroupIssue {
    #[error("Duplicate {section} groups {first} and {second}: identical common parameters")]
    SameParameters {
        section: SectionType,
        first: GroupId,
        second: GroupId,
    },

    #[error("Duplicate Display Format groups {first} and {second}: identical common parameters and format {format}")]
    SameFormat {
        first: GroupId,
        second: GroupId,
        format: DisplayFormat,
    },
}

impl DuplicateGroupIssue {
    pub fn group_ids(&self) -> Vec<GroupId> {
        match self {
            DuplicateGroupIssue::SameParameters { first, second, .. }
            | DuplicateGroupIssue::SameFormat { first, second, .. } => vec![*first, *second],
        }
    }
}

/// Rules that compete for the same input.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OverlapIssue {
    #[error("Overlapping ranges: {first} ({first_range}) and {second} ({second_range})")]
    Ranges {
        first: RuleRef,
        second: RuleRef,
        first_range: String,
        second_range: String,
    },

    #[error("Multiple 'single' rules in capping group {group_id} ({count} found, at most one allowed)")]
    MultipleSingleCaps { group_id: GroupId, rules: Vec<usize>, count: usize },

    #[error("Multiple 'ranges' rules in capping group {group_id} ({count} found, at most one allowed)")]
    MultipleRangeCaps { group_id: GroupId, rules: Vec<usize>, count: usize },

    #[error("Too many formats in display format group {group_id}: {count} rules, expected one")]
    TooManyFormats { group_id: GroupId, count: usize },
}

impl OverlapIssue {
    pub fn group_ids(&self) -> Vec<GroupId> {
        match self {
            OverlapIssue::Ranges { first, second, .. } => {
                if first.group_id == second.group_id {
                    vec![first.group_id]
                } else {
                    vec![first.group_id, second.group_id]
                }
            }
            OverlapIssue::MultipleSingleCaps { group_id, .. }
            | OverlapIssue::MultipleRangeCaps { group_id, .. }
            | OverlapIssue::TooManyFormats { group_id, .. } => vec![*group_id],
        }
    }
}

/// Missing or self-contradictory values.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RequiredFieldIssue {
    #[error("Group {group_id} has no rules")]
    EmptyGroup { group_id: GroupId },

    #[error("{rule}: lower bound {lower_bound} exceeds upper bound {upper_bound}")]
    InvertedRange {
        rule: RuleRef,
        lower_bound: i64,
        upper_bound: i64,
    },

    #[error("{rule}: {field} minimum {min} exceeds maximum {max}")]
    InvertedCap {
        rule: RuleRef,
        field: &'static str,
        min: i64,
        max: i64,
    },

    #[error("{rule}: empty {dimension} interval ({greater_than}, {less_than_or_equal_to}]")]
    InvertedInterval {
        rule: RuleRef,
        dimension: &'static str,
        greater_than: i64,
        less_than_or_equal_to: i64,
    },
}

impl RequiredFieldIssue {
    pub fn group_ids(&self) -> Vec<GroupId> {
        match self {
            RequiredFieldIssue::EmptyGroup { group_id } => vec![*group_id],
            RequiredFieldIssue::InvertedRange { rule, .. }
            | RequiredFieldIssue::InvertedCap { rule, .. }
            | RequiredFieldIssue::InvertedInterval { rule, .. } => vec![rule.group_id],
        }
    }
}

/// Validation result with the three issue lists
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub duplicate_groups: Vec<DuplicateGroupIssue>,
    pub overlapping_rules: Vec<OverlapIssue>,
    pub required_fields: Vec<RequiredFieldIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.duplicate_groups.is_empty()
            && self.overlapping_rules.is_empty()
            && self.required_fields.is_empty()
    }

    pub fn issue_count(&self) -> usize {
        self.duplicate_groups.len() + self.overlapping_rules.len() + self.required_fields.len()
    }

    /// Human readable messages, in list order.
    pub fn messages(&self) -> Vec<String> {
        self.duplicate_groups
            .iter()
            .map(ToString::to_string)
            .chain(self.overlapping_rules.iter().map(ToString::to_string))
            .chain(self.required_fields.iter().map(ToString::to_string))
            .collect()
    }

    /// Whether any issue points at `group_id`.
    pub fn mentions(&self, group_id: GroupId) -> bool {
        self.duplicate_groups.iter().any(|i| i.group_ids().contains(&group_id))
            || self.overlapping_rules.iter().any(|i| i.group_ids().contains(&group_id))
            || self.required_fields.iter().any(|i| i.group_ids().contains(&group_id))
    }
}

/// Two ranges rules overlap iff their PDT intervals overlap and their
/// Mean-Delay intervals overlap. Boundary-adjacent intervals do not overlap;
/// a rule without any Mean-Delay bound overlaps on that dimension.
pub fn ranges_overlap(a: &Bounds, b: &Bounds) -> bool {
    if !a.pdt().overlaps(&b.pdt()) {
        return false;
    }
    if a.mean_delay().is_unbounded() || b.mean_delay().is_unbounded() {
        return true;
    }
    a.mean_delay().overlaps(&b.mean_delay())
}

/// Index pairs of overlapping ranges rules, in (i, j) order with i < j.
pub fn overlapping_ranges(rules: &[Rule]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 0..rules.len() {
        for j in (i + 1)..rules.len() {
            if is_ranges(&rules[i]) && is_ranges(&rules[j]) && ranges_overlap(&rules[i].bounds, &rules[j].bounds) {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

fn is_ranges(rule: &Rule) -> bool {
    matches!(rule.body, RuleBody::Ranges { .. })
}

/// Positions of capping rules by variant, reported only when a variant
/// appears more than once.
pub fn overlapping_capping(rules: &[Rule]) -> Vec<(CappingKind, Vec<usize>)> {
    let mut singles = Vec::new();
    let mut ranges = Vec::new();
    for (index, rule) in rules.iter().enumerate() {
        if let RuleBody::Capping { cap } = rule.body {
            match cap.kind() {
                CappingKind::Single => singles.push(index),
                CappingKind::Ranges => ranges.push(index),
            }
        }
    }
    let mut found = Vec::new();
    if singles.len() > 1 {
        found.push((CappingKind::Single, singles));
    }
    if ranges.len() > 1 {
        found.push((CappingKind::Ranges, ranges));
    }
    found
}

/// Group validator
#[derive(Debug, Clone, Default)]
pub struct OverlapValidator;

impl OverlapValidator {
    pub fn new() -> Self {
        Self
    }

    /// Full analysis of the given groups
    pub fn validate(&self, groups: &[Group]) -> ValidationReport {
        let mut report = ValidationReport::default();

        // 1. Duplicate groups
        report.duplicate_groups = self.duplicate_groups(groups);

        // 2. Per-group rule checks
        for group in groups {
            match group.section {
                SectionType::Ranges => self.check_ranges_group(group, &mut report),
                SectionType::Capping => self.check_capping_group(group, &mut report),
                SectionType::DisplayFormat if group.rules.len() > 1 => {
                    report.overlapping_rules.push(OverlapIssue::TooManyFormats {
                        group_id: group.id,
                        count: group.rules.len(),
                    });
                }
                _ => {}
            }
        }

        // 3. Ranges rules split across groups with the same parameters
        self.check_ranges_across_groups(groups, &mut report);

        // 4. Required fields
        for group in groups {
            self.check_required_fields(group, &mut report);
        }

        report
    }

    /// Pairs of same-section groups with identical common parameters.
    ///
    /// Display-format duplicates also need a format in common. Ranges
    /// duplicates also need a PDT window in common, since rebuild puts each
    /// window in its own group. Capping and rounding compare parameters only.
    pub fn duplicate_groups(&self, groups: &[Group]) -> Vec<DuplicateGroupIssue> {
        let mut issues = Vec::new();
        for (i, first) in groups.iter().enumerate() {
            for second in &groups[i + 1..] {
                if first.section != second.section || !same_parameters(first, second) {
                    continue;
                }
                match first.section {
                    SectionType::DisplayFormat => {
                        if let Some(format) = shared_format(first, second) {
                            issues.push(DuplicateGroupIssue::SameFormat {
                                first: first.id,
                                second: second.id,
                                format,
                            });
                        }
                    }
                    SectionType::Ranges if !share_pdt_window(first, second) => {}
                    section => issues.push(DuplicateGroupIssue::SameParameters {
                        section,
                        first: first.id,
                        second: second.id,
                    }),
                }
            }
        }
        issues
    }

    fn check_ranges_group(&self, group: &Group, report: &mut ValidationReport) {
        for (i, j) in overlapping_ranges(&group.rules) {
            report.overlapping_rules.push(ranges_issue(group, i, group, j));
        }
    }

    fn check_ranges_across_groups(&self, groups: &[Group], report: &mut ValidationReport) {
        let ranges: Vec<&Group> = groups.iter().filter(|g| g.section == SectionType::Ranges).collect();
        for (i, first) in ranges.iter().enumerate() {
            for second in &ranges[i + 1..] {
                if !same_parameters(first, second) {
                    continue;
                }
                for (a, rule_a) in first.rules.iter().enumerate() {
                    for (b, rule_b) in second.rules.iter().enumerate() {
                        if is_ranges(rule_a) && is_ranges(rule_b) && ranges_overlap(&rule_a.bounds, &rule_b.bounds) {
                            report.overlapping_rules.push(ranges_issue(first, a, second, b));
                        }
                    }
                }
            }
        }
    }

    fn check_capping_group(&self, group: &Group, report: &mut ValidationReport) {
        for (kind, rules) in overlapping_capping(&group.rules) {
            let count = rules.len();
            report.overlapping_rules.push(match kind {
                CappingKind::Single => OverlapIssue::MultipleSingleCaps {
                    group_id: group.id,
                    rules,
                    count,
                },
                CappingKind::Ranges => OverlapIssue::MultipleRangeCaps {
                    group_id: group.id,
                    rules,
                    count,
                },
            });
        }
    }

    fn check_required_fields(&self, group: &Group, report: &mut ValidationReport) {
        if group.rules.is_empty() {
            report.required_fields.push(RequiredFieldIssue::EmptyGroup { group_id: group.id });
            return;
        }

        for (index, rule) in group.rules.iter().enumerate() {
            let rule_ref = RuleRef::of(group, index);
            match rule.body {
                RuleBody::Ranges {
                    lower_bound,
                    upper_bound,
                } if lower_bound > upper_bound => {
                    report.required_fields.push(RequiredFieldIssue::InvertedRange {
                        rule: rule_ref,
                        lower_bound,
                        upper_bound,
                    });
                }
                RuleBody::Capping { cap } => {
                    for (field, min, max) in inverted_caps(&cap) {
                        report.required_fields.push(RequiredFieldIssue::InvertedCap {
                            rule: rule_ref,
                            field,
                            min,
                            max,
                        });
                    }
                }
                _ => {}
            }

            for (dimension, interval) in [("PDT", rule.bounds.pdt()), ("Mean Delay", rule.bounds.mean_delay())] {
                if let (true, Some(gt), Some(lte)) = (
                    interval.is_inverted(),
                    interval.greater_than,
                    interval.less_than_or_equal_to,
                ) {
                    report.required_fields.push(RequiredFieldIssue::InvertedInterval {
                        rule: rule_ref,
                        dimension,
                        greater_than: gt,
                        less_than_or_equal_to: lte,
                    });
                }
            }
        }
    }
}

fn same_parameters(a: &Group, b: &Group) -> bool {
    a.has_conditions == b.has_conditions && a.common_params == b.common_params
}

fn shared_format(a: &Group, b: &Group) -> Option<DisplayFormat> {
    let formats = |g: &Group| -> Vec<DisplayFormat> {
        g.rules
            .iter()
            .filter_map(|r| match r.body {
                RuleBody::DisplayFormat { format } => Some(format),
                _ => None,
            })
            .collect()
    };
    let theirs = formats(b);
    formats(a).into_iter().find(|f| theirs.contains(f))
}

fn share_pdt_window(a: &Group, b: &Group) -> bool {
    a.rules
        .iter()
        .any(|ra| b.rules.iter().any(|rb| ra.bounds.pdt() == rb.bounds.pdt()))
}

fn ranges_issue(first: &Group, a: usize, second: &Group, b: usize) -> OverlapIssue {
    OverlapIssue::Ranges {
        first: RuleRef::of(first, a),
        second: RuleRef::of(second, b),
        first_range: first.rules[a].bounds.describe(),
        second_range: second.rules[b].bounds.describe(),
    }
}

fn inverted_caps(cap: &CappingRule) -> Vec<(&'static str, i64, i64)> {
    match *cap {
        CappingRule::Single { min, max } if min > max => vec![("single", min, max)],
        CappingRule::Single { .. } => Vec::new(),
        CappingRule::Ranges {
            min_lower_bound,
            min_upper_bound,
            max_lower_bound,
            max_upper_bound,
        } => {
            let mut found = Vec::new();
            if min_lower_bound > min_upper_bound {
                found.push(("min range", min_lower_bound, min_upper_bound));
            }
            if max_lower_bound > max_upper_bound {
                found.push(("max range", max_lower_bound, max_upper_bound));
            }
            found
        }
    }
}
