//! Mapping and Rollup Rule Management
//!
//! This module implements the rule layer of the pipeline: versioned rule sets
//! that describe how incoming metrics are mapped to storage policies and how
//! they are rolled up into derived metrics. Rules evolve over time through
//! append-only snapshot histories, and a point-in-time projection of a rule
//! set (the active rule set) answers match queries over a time range.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │            RuleSet                  │
//! │  namespace + versioned rule CRUD    │
//! └─────────────────────────────────────┘
//!                  ↓ active_set(t)
//! ┌─────────────────────────────────────┐
//! │          ActiveRuleSet              │
//! │  trimmed snapshot histories         │
//! └─────────────────────────────────────┘
//!                  ↓ match_all(id, from, to)
//! ┌─────────────────────────────────────┐
//! │           MatchResult               │
//! │  staged mapping + rollup policies   │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Key Components
//!
//! - **Mapping rules**: attach storage policies to matching metric ids
//! - **Rollup rules**: synthesize new rolled-up ids from matching metrics
//! - **Active rule set**: immutable projection used by the match path
//! - **Schema types**: serde representations for durable storage

pub mod active;
pub mod mapping;
pub mod rollup;
pub mod ruleset;
pub mod schema;
pub mod view;

pub use active::{ActiveRuleSet, MatchMode, MatchResult, Matcher};
pub use mapping::{MappingRule, MappingRuleSnapshot};
pub use rollup::{RollupResult, RollupRule, RollupRuleSnapshot, RollupTarget};
pub use ruleset::{
    MappingRules, Options, RollupRules, RuleSet, RuleSetUpdateHelper, UpdateMetadata,
    UNINITIALIZED_RULE_SET_VERSION,
};
pub use schema::RuleSetSchema;
pub use view::{MappingRuleView, RollupRuleView, RollupTargetView};
