//! Rule views
//!
//! Views are the author-facing records of a rule's state: the payload of a
//! change request coming from an API/UI layer, and the per-snapshot records
//! returned by the ruleset history queries.

use serde::{Deserialize, Serialize};

use crate::filter::RawFilters;
use crate::policy::Policy;

/// One mapping rule state: change-request payload or history record
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MappingRuleView {
    /// Rule uuid; empty when requesting a new rule
    #[serde(default)]
    pub id: String,
    /// Rule name, unique among non-tombstoned mapping rules
    pub name: String,
    /// Whether this state is a tombstone
    #[serde(default)]
    pub tombstoned: bool,
    /// When this state becomes authoritative
    #[serde(default)]
    pub cutover_nanos: i64,
    /// Raw tag filters selecting the metric ids the rule applies to
    pub filters: RawFilters,
    /// Aggregation policies applied to matched metrics
    pub policies: Vec<Policy>,
    /// Who last changed the rule
    #[serde(default)]
    pub last_updated_by: String,
    /// When the rule was last changed
    #[serde(default)]
    pub last_updated_at_nanos: i64,
}

/// One rollup target state within a rollup rule view
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollupTargetView {
    /// Name of the derived rollup metric
    pub name: String,
    /// Tag names preserved by the rollup, ascending
    pub tags: Vec<String>,
    /// Policies applied to the rollup output stream
    pub policies: Vec<Policy>,
}

/// One rollup rule state: change-request payload or history record
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollupRuleView {
    /// Rule uuid; empty when requesting a new rule
    #[serde(default)]
    pub id: String,
    /// Rule name, unique among non-tombstoned rollup rules
    pub name: String,
    /// Whether this state is a tombstone
    #[serde(default)]
    pub tombstoned: bool,
    /// When this state becomes authoritative
    #[serde(default)]
    pub cutover_nanos: i64,
    /// Raw tag filters selecting the metric ids the rule applies to
    pub filters: RawFilters,
    /// Rollup transformations produced by the rule
    pub targets: Vec<RollupTargetView>,
    /// Who last changed the rule
    #[serde(default)]
    pub last_updated_by: String,
    /// When the rule was last changed
    #[serde(default)]
    pub last_updated_at_nanos: i64,
}
