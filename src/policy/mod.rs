//! Aggregation policies and policy resolution
//!
//! A policy pairs a storage policy (resolution + retention) with the set of
//! aggregation functions to apply. Policies evolve over time: a
//! [`StagedPolicies`] records which policy set is authoritative starting at a
//! given cutover instant, and a [`PoliciesList`] records how that set evolves
//! across an interval.
//!
//! # Key Types
//!
//! - **`AggregationType` / `AggregationId`**: aggregation functions and a
//!   compact set of them
//! - **`Resolution` / `Retention` / `StoragePolicy`**: how densely and how
//!   long aggregated data is kept
//! - **`Policy`**: storage policy + aggregation function set
//! - **`StagedPolicies` / `PoliciesList`**: time-staged policy evolution
//! - **`resolve_policies`**: conflict resolution across overlapping rules

pub mod aggregation;
pub mod staged;

mod storage;

pub use aggregation::{AggregationId, AggregationType};
pub use staged::{PoliciesList, StagedPolicies};
pub use storage::{resolve_policies, Policy, Resolution, Retention, StoragePolicy};
