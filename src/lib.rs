//! Kuba Rules - Temporal rule management for metrics aggregation policies
//!
//! This library implements the rule layer that decides how metrics are
//! aggregated and stored:
//! - Storage policies pairing resolutions with retention periods
//! - Mapping rules attaching policies to metrics matched by tag filters
//! - Rollup rules synthesizing new rolled-up metric IDs from tag subsets
//! - Versioned rule sets with append-only snapshot histories
//! - Point-in-time active rule sets answering match queries over time ranges

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod filter;
pub mod id;
pub mod policy;
pub mod rules;

// Re-export main types
pub use error::{Error, Result};
pub use policy::{
    resolve_policies, AggregationId, AggregationType, PoliciesList, Policy, Resolution, Retention,
    StagedPolicies, StoragePolicy,
};
pub use rules::{
    ActiveRuleSet, MatchMode, MatchResult, Matcher, Options, RollupResult, RuleSet,
    RuleSetSchema, RuleSetUpdateHelper, UpdateMetadata,
};
