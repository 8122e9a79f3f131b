//! Time-staged policy sets
//!
//! Matching a metric id over an interval yields a sequence of policy stages:
//! each stage records the instant it became authoritative (cutover), whether
//! it represents deletion (tombstone), and the resolved policies in effect.

use serde::{Deserialize, Serialize};

use super::storage::Policy;

/// The policy set that is authoritative starting at a given instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StagedPolicies {
    /// The instant this stage became authoritative, nanoseconds since epoch
    pub cutover_nanos: i64,
    /// Whether the matched rule set was deleted at this instant
    pub tombstoned: bool,
    /// Resolved policies, ascending by resolution window
    pub policies: Vec<Policy>,
}

impl StagedPolicies {
    /// Create a new staged policy set
    pub fn new(cutover_nanos: i64, tombstoned: bool, policies: Vec<Policy>) -> Self {
        Self {
            cutover_nanos,
            tombstoned,
            policies,
        }
    }

    /// The well-known sentinel for "no rule matched": cutover 0, not
    /// tombstoned, no policies
    pub fn default_staged() -> Self {
        Self::default()
    }

    /// Whether this is the default sentinel
    pub fn is_default(&self) -> bool {
        self.cutover_nanos == 0 && !self.tombstoned && self.policies.is_empty()
    }

    /// Whether two stages carry the same policies
    ///
    /// Compares tombstone state and the policy sequences in order; callers
    /// rely on both sequences being in the canonical order produced by
    /// [`resolve_policies`](super::resolve_policies), so no set comparison
    /// is performed.
    pub fn same_policies(&self, other: &StagedPolicies) -> bool {
        self.tombstoned == other.tombstoned && self.policies == other.policies
    }
}

/// How the applicable policy set evolves over an interval, ascending by
/// cutover time
pub type PoliciesList = Vec<StagedPolicies>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AggregationId, Resolution, Retention};
    use std::time::Duration;

    fn policy(window_secs: u64) -> Policy {
        Policy::new(
            Resolution::from_duration(Duration::from_secs(window_secs)),
            Retention::from_duration(Duration::from_secs(86400)),
            AggregationId::DEFAULT,
        )
    }

    #[test]
    fn test_default_sentinel() {
        let staged = StagedPolicies::default_staged();
        assert!(staged.is_default());
        assert!(!StagedPolicies::new(1, false, vec![]).is_default());
        assert!(!StagedPolicies::new(0, true, vec![]).is_default());
    }

    #[test]
    fn test_same_policies_ignores_cutover() {
        let a = StagedPolicies::new(100, false, vec![policy(60)]);
        let b = StagedPolicies::new(200, false, vec![policy(60)]);
        assert!(a.same_policies(&b));
    }

    #[test]
    fn test_same_policies_tombstone_and_order_sensitive() {
        let a = StagedPolicies::new(100, false, vec![policy(60), policy(3600)]);
        let b = StagedPolicies::new(100, true, vec![policy(60), policy(3600)]);
        assert!(!a.same_policies(&b));

        let c = StagedPolicies::new(100, false, vec![policy(3600), policy(60)]);
        assert!(!a.same_policies(&c));
    }
}
