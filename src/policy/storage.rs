//! Storage policies and policy conflict resolution
//!
//! A [`StoragePolicy`] says how densely (resolution) and how long (retention)
//! aggregated data for a metric is kept. A [`Policy`] pairs a storage policy
//! with the aggregation functions to apply. [`resolve_policies`] collapses a
//! set of policies gathered from multiple matched rules down to at most one
//! policy per distinct resolution window.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::aggregation::AggregationId;

/// The time-bucket window of aggregated data
///
/// Two policies are "the same resolution" exactly when their windows are
/// equal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Resolution {
    /// Window size in nanoseconds
    pub window_nanos: i64,
}

impl Resolution {
    /// Create a resolution from a window in nanoseconds
    pub fn from_nanos(window_nanos: i64) -> Self {
        Self { window_nanos }
    }

    /// Create a resolution from a duration
    pub fn from_duration(window: Duration) -> Self {
        Self {
            window_nanos: window.as_nanos() as i64,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.window_nanos as f64 / 1e9)
    }
}

/// How long aggregated data is retained
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Retention {
    /// Retention period in nanoseconds
    pub period_nanos: i64,
}

impl Retention {
    /// Create a retention from a period in nanoseconds
    pub fn from_nanos(period_nanos: i64) -> Self {
        Self { period_nanos }
    }

    /// Create a retention from a duration
    pub fn from_duration(period: Duration) -> Self {
        Self {
            period_nanos: period.as_nanos() as i64,
        }
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.period_nanos as f64 / 1e9)
    }
}

/// Resolution + retention for one aggregated stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct StoragePolicy {
    /// Aggregation window
    pub resolution: Resolution,
    /// Retention period
    pub retention: Retention,
}

impl StoragePolicy {
    /// Create a new storage policy
    pub fn new(resolution: Resolution, retention: Retention) -> Self {
        Self {
            resolution,
            retention,
        }
    }
}

impl fmt::Display for StoragePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resolution, self.retention)
    }
}

/// An aggregation policy: storage policy + aggregation function set
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use kuba_rules::policy::{AggregationId, Policy, Resolution, Retention};
///
/// let policy = Policy::new(
///     Resolution::from_duration(Duration::from_secs(60)),
///     Retention::from_duration(Duration::from_secs(30 * 86400)),
///     AggregationId::DEFAULT,
/// );
/// assert_eq!(policy.resolution().window_nanos, 60_000_000_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Policy {
    /// Where and how long the aggregated stream is stored
    pub storage_policy: StoragePolicy,
    /// Which aggregation functions produce the stream
    pub aggregation_id: AggregationId,
}

impl Policy {
    /// Create a new policy
    pub fn new(resolution: Resolution, retention: Retention, aggregation_id: AggregationId) -> Self {
        Self {
            storage_policy: StoragePolicy::new(resolution, retention),
            aggregation_id,
        }
    }

    /// Create a policy from an existing storage policy
    pub fn from_storage_policy(storage_policy: StoragePolicy, aggregation_id: AggregationId) -> Self {
        Self {
            storage_policy,
            aggregation_id,
        }
    }

    /// The policy's aggregation window
    pub fn resolution(&self) -> Resolution {
        self.storage_policy.resolution
    }

    /// The policy's retention period
    pub fn retention(&self) -> Retention {
        self.storage_policy.retention
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.storage_policy, self.aggregation_id)
    }
}

/// Resolve conflicts among policies gathered from multiple matched rules
///
/// Policies are stable-sorted ascending by resolution window, then collapsed
/// so that at most one policy per distinct window remains. At a tied window
/// the first-seen policy's storage policy is kept and the aggregation
/// function sets are merged.
///
/// Note the tie-break between same-window policies with different retentions
/// is order-of-first-appearance after the stable sort: there is no secondary
/// sort by retention, so which retention survives depends on input order.
pub fn resolve_policies(mut policies: Vec<Policy>) -> Vec<Policy> {
    if policies.is_empty() {
        return policies;
    }
    policies.sort_by_key(|p| p.resolution().window_nanos);

    // curr is the index of the last policy kept so far.
    let mut curr = 0;
    for i in 1..policies.len() {
        if policies[curr].resolution().window_nanos == policies[i].resolution().window_nanos {
            let (merged, changed) = policies[curr]
                .aggregation_id
                .merge(policies[i].aggregation_id);
            if changed {
                policies[curr] =
                    Policy::from_storage_policy(policies[curr].storage_policy, merged);
            }
            continue;
        }
        // A strictly larger window than the current kept policy, keep it.
        curr += 1;
        policies[curr] = policies[i];
    }
    policies.truncate(curr + 1);
    policies
}
