// examples/import_usage.rs
//
// This example walks through importing a document, reviewing the diff,
// editing the resulting groups and generating the textual form.
//
// Run with: cargo run --example import_usage

use config_engine::rule_store::RuleUpdate;
use config_engine::{
    DocumentKind, ImportReconciler, LineStatus, OverlapValidator, RuleStore, SectionType,
    SerializationEngine,
};
use std::collections::BTreeMap;

const DOCUMENT: &str = "\
config_format_version: \"1\"
variant: control
platform: ios
country_code: US

pdt:
  - display_format:
      - format: RANGE
        conditions:
          delivery_mode: DELIVERY
  - ranges:
      - delivery_option: STANDARD
        lower_bound: 10
        upper_bound: 20
        conditions:
          vertical_types:
            - restaurants
          pdt_less_than_or_equal_to: 13
      - delivery_option: STANDARD
        lower_bound: 15
        upper_bound: 25
        conditions:
          vertical_types:
            - restaurants
          pdt_greater_than: 13
          pdt_less_than_or_equal_to: 18
";

fn main() {
    println!("=== Import Reconciler - Usage Examples ===\n");

    let store = example_1_prepare_import();
    let store = example_2_edit_groups(store);
    example_3_generate(&store);
}

/// Example 1: Preparing an import and reviewing its diff
fn example_1_prepare_import() -> RuleStore {
    println!("Example 1: Preparing an Import");
    println!("==============================");

    let plan = match ImportReconciler::prepare(DOCUMENT, DocumentKind::Yaml) {
        Ok(plan) => plan,
        Err(e) => {
            println!("Import rejected: {}", e);
            return RuleStore::new(Default::default());
        }
    };

    for warning in &plan.warnings {
        println!("  warning: {}", warning);
    }
    println!("  unmatched diff lines: {}", plan.diff.unmatched_lines());
    for line in plan.diff.merged_annotated.iter().filter(|l| l.status != LineStatus::Context) {
        println!("  {:>3} {:?} {}", line.number, line.status, line.text);
    }

    // Committing is an explicit step.
    let store = RuleStore::new(plan.merged);
    for group in store.groups().iter() {
        println!("  {} [{}] {} rule(s)", group.id, group.title, group.rules.len());
    }
    println!();
    store
}

/// Example 2: Editing groups and checking for issues
fn example_2_edit_groups(mut store: RuleStore) -> RuleStore {
    println!("Example 2: Editing Groups");
    println!("=========================");

    let mut params = BTreeMap::new();
    params.insert("delivery_option".to_string(), "STANDARD".to_string());
    params.insert("vertical_types".to_string(), "restaurants".to_string());
    let group = store.add_group(SectionType::Ranges, params, None);
    if let Some(rule) = store.add_rule(group) {
        store.update_rule(group, rule, RuleUpdate::PdtGreaterThan(Some(10)));
        store.update_rule(group, rule, RuleUpdate::PdtLessThanOrEqualTo(Some(20)));
        store.update_rule(group, rule, RuleUpdate::UpperBound(30));
    }

    let report = OverlapValidator::new().validate(store.groups().as_slice());
    println!("  valid: {}", report.is_valid());
    for message in report.messages() {
        println!("  - {}", message);
    }
    println!();
    store
}

/// Example 3: Generating the textual and JSON forms
fn example_3_generate(store: &RuleStore) {
    println!("Example 3: Generating Output");
    println!("============================");

    println!("{}", SerializationEngine::generate(store.config()));
    match SerializationEngine::to_json(store.config()) {
        Ok(json) => println!("  JSON export: {} bytes", json.len()),
        Err(e) => println!("  JSON export failed: {}", e),
    }
}
