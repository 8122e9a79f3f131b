//! Integration tests for rule set management and matching
//!
//! These tests validate the complete rule pipeline:
//! - Rule CRUD with conflict validation and tombstoning
//! - Point-in-time active rule set projection
//! - Forward and reverse matching across cutover boundaries
//! - Rollup id synthesis from tag subsets
//! - Schema round-trips through serde

use std::collections::BTreeMap;
use std::time::Duration;

use kuba_rules::policy::{AggregationId, Policy, Resolution, Retention};
use kuba_rules::rules::view::{MappingRuleView, RollupRuleView, RollupTargetView};
use kuba_rules::rules::{MatchMode, Matcher, Options, RuleSet, UpdateMetadata};

const T0: i64 = 10_000;
const T1: i64 = 20_000;
const T2: i64 = 30_000;

// ============================================================================
// Helper Functions
// ============================================================================

fn policy(window_secs: u64, retention_days: u64) -> Policy {
    Policy::new(
        Resolution::from_duration(Duration::from_secs(window_secs)),
        Retention::from_duration(Duration::from_secs(retention_days * 86400)),
        AggregationId::DEFAULT,
    )
}

fn meta(time_nanos: i64) -> UpdateMetadata {
    UpdateMetadata::new(time_nanos, time_nanos, "integration-test")
}

fn filters(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn empty_ruleset() -> RuleSet {
    RuleSet::new_empty("testNamespace", meta(T0), Options::default())
}

fn mapping_view(name: &str, tag_filters: &[(&str, &str)], policies: Vec<Policy>) -> MappingRuleView {
    MappingRuleView {
        name: name.to_string(),
        filters: filters(tag_filters),
        policies,
        ..Default::default()
    }
}

fn rollup_view(
    name: &str,
    tag_filters: &[(&str, &str)],
    new_name: &str,
    tags: &[&str],
    policies: Vec<Policy>,
) -> RollupRuleView {
    RollupRuleView {
        name: name.to_string(),
        filters: filters(tag_filters),
        targets: vec![RollupTargetView {
            name: new_name.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            policies,
        }],
        ..Default::default()
    }
}

// ============================================================================
// Mapping Rule Matching
// ============================================================================

#[test]
fn test_mapping_match_across_cutovers() {
    let mut rs = empty_ruleset();
    let uuid = rs
        .add_mapping_rule(
            mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
            meta(T0),
        )
        .expect("add should succeed");

    let mut update = mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 90)]);
    update.id = uuid;
    rs.update_mapping_rule(update, meta(T1))
        .expect("update should succeed");

    let active = rs.active_set(0);
    let result = active.match_all(b"cpu.usage+region=east,service=web", T0, T2, MatchMode::Forward);

    assert_eq!(2, result.mappings().len());
    assert_eq!(T0, result.mappings()[0].cutover_nanos);
    assert_eq!(vec![policy(60, 30)], result.mappings()[0].policies);
    assert_eq!(T1, result.mappings()[1].cutover_nanos);
    assert_eq!(vec![policy(60, 90)], result.mappings()[1].policies);
    assert_eq!(i64::MAX, result.expire_at_nanos());
}

#[test]
fn test_match_result_expires_at_next_cutover() {
    let mut rs = empty_ruleset();
    let uuid = rs
        .add_mapping_rule(
            mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
            meta(T0),
        )
        .expect("add should succeed");

    let mut update = mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 90)]);
    update.id = uuid;
    rs.update_mapping_rule(update, meta(T1))
        .expect("update should succeed");

    // Matching strictly before the second cutover must expire at it.
    let active = rs.active_set(0);
    let result = active.match_all(b"cpu.usage+service=web", T0, T0 + 1, MatchMode::Forward);

    assert_eq!(1, result.mappings().len());
    assert_eq!(T1, result.expire_at_nanos());
    assert!(!result.has_expired(T1 - 1));
    assert!(result.has_expired(T1));
}

#[test]
fn test_non_matching_id_yields_default_stage() {
    let mut rs = empty_ruleset();
    rs.add_mapping_rule(
        mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
        meta(T0),
    )
    .expect("add should succeed");

    let active = rs.active_set(0);
    let result = active.match_all(b"cpu.usage+service=db", T0, T2, MatchMode::Forward);

    assert_eq!(1, result.mappings().len());
    assert!(result.mappings()[0].is_default());
    assert!(result.rollups().is_empty());
}

#[test]
fn test_deleted_mapping_rule_contributes_empty_stage() {
    let mut rs = empty_ruleset();
    let uuid = rs
        .add_mapping_rule(
            mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
            meta(T0),
        )
        .expect("add should succeed");
    rs.delete_mapping_rule(&uuid, meta(T1))
        .expect("delete should succeed");

    let active = rs.active_set(0);
    let result = active.match_all(b"cpu.usage+service=web", T0, T2, MatchMode::Forward);

    assert_eq!(2, result.mappings().len());
    assert_eq!(vec![policy(60, 30)], result.mappings()[0].policies);
    assert_eq!(T1, result.mappings()[1].cutover_nanos);
    assert!(result.mappings()[1].policies.is_empty());
}

#[test]
fn test_overlapping_mapping_rules_resolve() {
    let mut rs = empty_ruleset();
    rs.add_mapping_rule(
        mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
        meta(T0),
    )
    .expect("add should succeed");
    rs.add_mapping_rule(
        mapping_view(
            "cpu.wildcard",
            &[("service", "*")],
            vec![policy(10, 2), policy(60, 40)],
        ),
        meta(T0),
    )
    .expect("add should succeed");

    let active = rs.active_set(0);
    let result = active.match_all(b"cpu.usage+service=web", T0, T2, MatchMode::Forward);

    // Both rules match; resolution dedups the 60s window, keeping the
    // first-seen retention after the stable sort.
    assert_eq!(1, result.mappings().len());
    let stage = &result.mappings()[0];
    assert_eq!(2, stage.policies.len());
    assert_eq!(policy(10, 2), stage.policies[0]);
    assert_eq!(policy(60, 30), stage.policies[1]);
}

// ============================================================================
// Rollup Rule Matching
// ============================================================================

#[test]
fn test_rollup_tag_subset_synthesizes_id() {
    let mut rs = empty_ruleset();
    rs.add_rollup_rule(
        rollup_view(
            "requests.by_service",
            &[("service", "web")],
            "requests_by_svc",
            &["service"],
            vec![policy(60, 30)],
        ),
        meta(T0),
    )
    .expect("add should succeed");

    let active = rs.active_set(0);
    let result = active.match_all(
        b"requests+region=east,service=web",
        T0,
        T2,
        MatchMode::Forward,
    );

    assert_eq!(1, result.rollups().len());
    let rollup = &result.rollups()[0];
    assert_eq!(
        b"requests_by_svc+kuba_rollup=true,service=web".to_vec(),
        rollup.id
    );
    assert_eq!(1, rollup.policies_list.len());
    assert_eq!(vec![policy(60, 30)], rollup.policies_list[0].policies);
}

#[test]
fn test_rollup_target_requiring_absent_tag_is_skipped() {
    let mut rs = empty_ruleset();
    rs.add_rollup_rule(
        rollup_view(
            "requests.by_host",
            &[("service", "web")],
            "requests_by_host",
            &["host"],
            vec![policy(60, 30)],
        ),
        meta(T0),
    )
    .expect("add should succeed");

    let active = rs.active_set(0);
    // Filter matches but the id carries no "host" tag to roll up on.
    let result = active.match_all(b"requests+service=web", T0, T2, MatchMode::Forward);

    assert!(result.rollups().is_empty());
}

#[test]
fn test_deleted_rollup_rule_tombstones_its_id() {
    let mut rs = empty_ruleset();
    let uuid = rs
        .add_rollup_rule(
            rollup_view(
                "requests.by_service",
                &[("service", "web")],
                "requests_by_svc",
                &["service"],
                vec![policy(60, 30)],
            ),
            meta(T0),
        )
        .expect("add should succeed");
    rs.delete_rollup_rule(&uuid, meta(T1))
        .expect("delete should succeed");

    let active = rs.active_set(0);
    let result = active.match_all(b"requests+service=web", T0, T2, MatchMode::Forward);

    // The synthesized id exists at T0 and disappears at T1, which shows up
    // as a tombstone stage rather than a silent drop.
    assert_eq!(1, result.rollups().len());
    let stages = &result.rollups()[0].policies_list;
    assert_eq!(2, stages.len());
    assert!(!stages[0].tombstoned);
    assert_eq!(T1, stages[1].cutover_nanos);
    assert!(stages[1].tombstoned);
    assert!(stages[1].policies.is_empty());
}

// ============================================================================
// Reverse Matching
// ============================================================================

#[test]
fn test_reverse_match_of_rollup_id() {
    let mut rs = empty_ruleset();
    rs.add_rollup_rule(
        rollup_view(
            "requests.by_service",
            &[("service", "web")],
            "requests_by_svc",
            &["service"],
            vec![policy(60, 30)],
        ),
        meta(T0),
    )
    .expect("add should succeed");

    let active = rs.active_set(0);
    let result = active.match_all(
        b"requests_by_svc+kuba_rollup=true,service=web",
        T0,
        T2,
        MatchMode::Reverse,
    );

    assert_eq!(1, result.mappings().len());
    assert_eq!(T0, result.mappings()[0].cutover_nanos);
    assert_eq!(vec![policy(60, 30)], result.mappings()[0].policies);
    assert!(result.rollups().is_empty());
}

#[test]
fn test_reverse_match_of_plain_id_uses_mapping_rules() {
    let mut rs = empty_ruleset();
    rs.add_mapping_rule(
        mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
        meta(T0),
    )
    .expect("add should succeed");

    let active = rs.active_set(0);
    let result = active.match_all(b"cpu.usage+service=web", T0, T2, MatchMode::Reverse);

    assert_eq!(1, result.mappings().len());
    assert_eq!(vec![policy(60, 30)], result.mappings()[0].policies);
}

// ============================================================================
// CRUD Validation
// ============================================================================

#[test]
fn test_add_mapping_rule_name_conflict() {
    let mut rs = empty_ruleset();
    rs.add_mapping_rule(
        mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
        meta(T0),
    )
    .expect("add should succeed");

    let err = rs
        .add_mapping_rule(
            mapping_view("cpu.by_service", &[("service", "db")], vec![policy(60, 30)]),
            meta(T1),
        )
        .expect_err("duplicate name must be rejected");
    assert!(err.is_conflict());
}

#[test]
fn test_add_rollup_rule_duplicate_transform_conflict() {
    let mut rs = empty_ruleset();
    rs.add_rollup_rule(
        rollup_view(
            "requests.by_service",
            &[("service", "web")],
            "requests_by_svc",
            &["service"],
            vec![policy(60, 30)],
        ),
        meta(T0),
    )
    .expect("add should succeed");

    // Same target name and tag list in a different rule is ambiguous on the
    // reverse path and must be rejected, even with different policies.
    let err = rs
        .add_rollup_rule(
            rollup_view(
                "requests.other",
                &[("service", "db")],
                "requests_by_svc",
                &["service"],
                vec![policy(10, 2)],
            ),
            meta(T1),
        )
        .expect_err("duplicate transform must be rejected");
    assert!(err.is_conflict());
}

#[test]
fn test_double_delete_is_rejected() {
    let mut rs = empty_ruleset();
    let uuid = rs
        .add_mapping_rule(
            mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
            meta(T0),
        )
        .expect("add should succeed");
    rs.delete_mapping_rule(&uuid, meta(T1))
        .expect("first delete should succeed");

    let last_updated = rs.last_updated_at_nanos();
    assert!(rs.delete_mapping_rule(&uuid, meta(T2)).is_err());
    // A failed mutation must not advance the ruleset metadata.
    assert_eq!(last_updated, rs.last_updated_at_nanos());
}

#[test]
fn test_add_with_tombstoned_name_revives_in_place() {
    let mut rs = empty_ruleset();
    let uuid = rs
        .add_mapping_rule(
            mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
            meta(T0),
        )
        .expect("add should succeed");
    rs.delete_mapping_rule(&uuid, meta(T1))
        .expect("delete should succeed");

    let revived = rs
        .add_mapping_rule(
            mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 90)]),
            meta(T2),
        )
        .expect("re-add should revive");
    assert_eq!(uuid, revived);

    let histories = rs.mapping_rules().expect("histories should build");
    assert_eq!(3, histories[&uuid].len());
}

// ============================================================================
// Ruleset Lifecycle and Schema
// ============================================================================

#[test]
fn test_ruleset_delete_and_revive() {
    let mut rs = empty_ruleset();
    rs.add_mapping_rule(
        mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
        meta(T0),
    )
    .expect("add should succeed");

    rs.delete(meta(T1)).expect("delete should succeed");
    assert!(rs.tombstoned());
    assert!(rs.delete(meta(T2)).is_err());

    rs.revive(meta(T2)).expect("revive should succeed");
    assert!(!rs.tombstoned());

    // Reviving the ruleset does not revive its rules.
    let active = rs.active_set(T2);
    let result = active.match_all(b"cpu.usage+service=web", T2, T2 + 1, MatchMode::Forward);
    assert!(result.mappings()[0].policies.is_empty());
}

#[test]
fn test_schema_round_trip_through_json() {
    let mut rs = empty_ruleset();
    rs.add_mapping_rule(
        mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
        meta(T0),
    )
    .expect("add should succeed");
    rs.add_rollup_rule(
        rollup_view(
            "requests.by_service",
            &[("service", "web")],
            "requests_by_svc",
            &["service"],
            vec![policy(60, 30)],
        ),
        meta(T1),
    )
    .expect("add should succeed");

    let schema = rs.to_schema().expect("schema export should succeed");
    let json = serde_json::to_string(&schema).expect("serialize should succeed");
    let decoded = serde_json::from_str(&json).expect("deserialize should succeed");
    assert_eq!(schema, decoded);

    let restored =
        RuleSet::from_schema(3, Some(decoded), Options::default()).expect("import should succeed");
    assert_eq!(3, restored.version());
    assert_eq!(rs.uuid(), restored.uuid());

    // The restored ruleset matches identically.
    let result = restored.active_set(0).match_all(
        b"cpu.usage+service=web",
        T0,
        T2,
        MatchMode::Forward,
    );
    assert_eq!(vec![policy(60, 30)], result.mappings()[0].policies);
    assert_eq!(3, result.version());
}

#[test]
fn test_active_set_is_independent_of_later_mutations() {
    let mut rs = empty_ruleset();
    let uuid = rs
        .add_mapping_rule(
            mapping_view("cpu.by_service", &[("service", "web")], vec![policy(60, 30)]),
            meta(T0),
        )
        .expect("add should succeed");

    let active = rs.active_set(0);
    rs.delete_mapping_rule(&uuid, meta(T1))
        .expect("delete should succeed");

    // The projection taken before the delete still sees the rule.
    let result = active.match_all(b"cpu.usage+service=web", T0, T2, MatchMode::Forward);
    assert_eq!(1, result.mappings().len());
    assert_eq!(vec![policy(60, 30)], result.mappings()[0].policies);
}
