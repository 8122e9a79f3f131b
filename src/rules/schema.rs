//! Persistence schema for rulesets
//!
//! The structural records a ruleset is persisted as. The wire format is the
//! caller's concern: these are plain serde-derived data-transfer structs,
//! and the only guarantee is losslessness: loading a schema and storing it
//! again yields a structurally equal schema (the ruleset version is
//! caller-supplied and not part of the record).

use serde::{Deserialize, Serialize};

use crate::filter::RawFilters;
use crate::policy::Policy;

/// Persisted state of one mapping rule snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MappingRuleSnapshotSchema {
    /// Rule name at this snapshot
    pub name: String,
    /// Whether this snapshot is a tombstone
    #[serde(default)]
    pub tombstoned: bool,
    /// When this snapshot becomes authoritative
    pub cutover_nanos: i64,
    /// Raw tag filters as authored
    #[serde(default)]
    pub tag_filters: RawFilters,
    /// Aggregation policies
    #[serde(default)]
    pub policies: Vec<Policy>,
    /// When this snapshot was written
    #[serde(default)]
    pub last_updated_at_nanos: i64,
    /// Who wrote this snapshot
    #[serde(default)]
    pub last_updated_by: String,
}

/// Persisted state of one mapping rule: its full snapshot history
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MappingRuleSchema {
    /// Stable rule identity across edits
    pub uuid: String,
    /// Snapshot history, ascending by cutover time
    pub snapshots: Vec<MappingRuleSnapshotSchema>,
}

/// Persisted state of one rollup target
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollupTargetSchema {
    /// Name of the derived rollup metric
    pub name: String,
    /// Tag names preserved by the rollup
    pub tags: Vec<String>,
    /// Policies applied to the rollup output stream
    #[serde(default)]
    pub policies: Vec<Policy>,
}

/// Persisted state of one rollup rule snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollupRuleSnapshotSchema {
    /// Rule name at this snapshot
    pub name: String,
    /// Whether this snapshot is a tombstone
    #[serde(default)]
    pub tombstoned: bool,
    /// When this snapshot becomes authoritative
    pub cutover_nanos: i64,
    /// Raw tag filters as authored
    #[serde(default)]
    pub tag_filters: RawFilters,
    /// Rollup transformations
    #[serde(default)]
    pub targets: Vec<RollupTargetSchema>,
    /// When this snapshot was written
    #[serde(default)]
    pub last_updated_at_nanos: i64,
    /// Who wrote this snapshot
    #[serde(default)]
    pub last_updated_by: String,
}

/// Persisted state of one rollup rule: its full snapshot history
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollupRuleSchema {
    /// Stable rule identity across edits
    pub uuid: String,
    /// Snapshot history, ascending by cutover time
    pub snapshots: Vec<RollupRuleSnapshotSchema>,
}

/// Persisted state of a whole ruleset for one namespace
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleSetSchema {
    /// Ruleset identity
    pub uuid: String,
    /// Metrics namespace the ruleset applies to
    pub namespace: String,
    /// When the ruleset was created
    #[serde(default)]
    pub created_at_nanos: i64,
    /// When the ruleset was last updated
    #[serde(default)]
    pub last_updated_at_nanos: i64,
    /// Who last updated the ruleset
    #[serde(default)]
    pub last_updated_by: String,
    /// Whether the ruleset is tombstoned
    #[serde(default)]
    pub tombstoned: bool,
    /// When the ruleset takes effect
    #[serde(default)]
    pub cutover_nanos: i64,
    /// All mapping rules with their histories
    #[serde(default)]
    pub mapping_rules: Vec<MappingRuleSchema>,
    /// All rollup rules with their histories
    #[serde(default)]
    pub rollup_rules: Vec<RollupRuleSchema>,
}
