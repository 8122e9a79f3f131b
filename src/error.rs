//! Error types for rule and policy resolution

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for rule storage and matching
#[derive(Error, Debug)]
pub enum Error {
    /// No rule with the given id or name exists in the ruleset
    #[error("no such rule exists")]
    NoSuchRule,

    /// A rule has no snapshots and therefore no readable state
    #[error("rule has no snapshots")]
    NoRuleSnapshots,

    /// Tombstoning was applied to an already-tombstoned entity
    #[error("{0} is already tombstoned")]
    AlreadyTombstoned(String),

    /// Revival was applied to an entity that is not tombstoned
    #[error("{0} is not tombstoned")]
    NotTombstoned(String),

    /// The persisted ruleset schema is missing
    #[error("nil rule set schema")]
    NilRuleSetSchema,

    /// The persisted ruleset schema is structurally invalid
    #[error("invalid rule set schema: {0}")]
    InvalidSchema(String),

    /// A raw tag filter could not be compiled
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// An unrecognized match mode string
    #[error("unknown match mode: {0}")]
    UnknownMatchMode(String),

    /// A metric id could not be decomposed into name and tags
    #[error("invalid metric id: {0}")]
    InvalidMetricId(String),

    /// A rule modification conflicts with the current state of the ruleset
    ///
    /// Carries the uuid of the conflicting rule so callers can surface
    /// or remediate the collision.
    #[error("rule conflict: {reason} (conflicting rule {conflicting_rule_uuid})")]
    RuleConflict {
        /// Uuid of the already-existing rule the change collides with
        conflicting_rule_uuid: String,
        /// Human-readable description of the collision
        reason: String,
    },

    /// A mutation failed; wraps the underlying error with the attempted
    /// action and rule name/id for diagnostics
    #[error("cannot {action} rule {rule}: {source}")]
    RuleAction {
        /// The attempted action ("add", "update", "delete", "revive")
        action: &'static str,
        /// The rule name or uuid the action targeted
        rule: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A ruleset-level mutation failed
    #[error("cannot {action} ruleset {namespace}: {source}")]
    RuleSetAction {
        /// The attempted action ("delete", "revive")
        action: &'static str,
        /// The namespace of the target ruleset
        namespace: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with the rule action that produced it
    pub(crate) fn for_rule_action(self, action: &'static str, rule: impl Into<String>) -> Self {
        Error::RuleAction {
            action,
            rule: rule.into(),
            source: Box::new(self),
        }
    }

    /// Wrap this error with the ruleset action that produced it
    pub(crate) fn for_ruleset_action(
        self,
        action: &'static str,
        namespace: impl Into<String>,
    ) -> Self {
        Error::RuleSetAction {
            action,
            namespace: namespace.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error (or the error it wraps) is a rule conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::RuleConflict { .. } => true,
            Error::RuleAction { source, .. } | Error::RuleSetAction { source, .. } => {
                source.is_conflict()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wrapping_display() {
        let err = Error::AlreadyTombstoned("cpu.by_host".to_string())
            .for_rule_action("delete", "cpu.by_host");
        assert_eq!(
            err.to_string(),
            "cannot delete rule cpu.by_host: cpu.by_host is already tombstoned"
        );
    }

    #[test]
    fn test_conflict_detection_through_wrapping() {
        let err = Error::RuleConflict {
            conflicting_rule_uuid: "abc".to_string(),
            reason: "rule with name foo already exists".to_string(),
        }
        .for_rule_action("add", "foo");
        assert!(err.is_conflict());
        assert!(!Error::NoSuchRule.is_conflict());
    }
}
