//! Mapping rules
//!
//! A mapping rule associates a filter over raw metric ids with a set of
//! aggregation policies. Each rule is an append-only, cutover-ordered
//! sequence of immutable snapshots: its entire edit history, including
//! tombstones. Current state is always read off the last snapshot.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::filter::{Filter, NewFilterFn, RawFilters};
use crate::policy::Policy;
use crate::rules::ruleset::UpdateMetadata;
use crate::rules::schema::{MappingRuleSchema, MappingRuleSnapshotSchema};
use crate::rules::view::MappingRuleView;

/// One immutable state of a mapping rule
#[derive(Debug, Clone)]
pub struct MappingRuleSnapshot {
    pub(crate) name: String,
    pub(crate) tombstoned: bool,
    pub(crate) cutover_nanos: i64,
    pub(crate) filter: Arc<dyn Filter>,
    pub(crate) raw_filters: RawFilters,
    pub(crate) policies: Vec<Policy>,
    pub(crate) last_updated_at_nanos: i64,
    pub(crate) last_updated_by: String,
}

impl MappingRuleSnapshot {
    fn from_fields(
        name: String,
        raw_filters: RawFilters,
        policies: Vec<Policy>,
        meta: &UpdateMetadata,
        new_filter_fn: &NewFilterFn,
    ) -> Result<Self> {
        let filter = new_filter_fn(&raw_filters)?;
        Ok(Self {
            name,
            tombstoned: false,
            cutover_nanos: meta.cutover_nanos(),
            filter,
            raw_filters,
            policies,
            last_updated_at_nanos: meta.updated_at_nanos(),
            last_updated_by: meta.updated_by().to_string(),
        })
    }

    pub(crate) fn from_schema(
        schema: MappingRuleSnapshotSchema,
        new_filter_fn: &NewFilterFn,
    ) -> Result<Self> {
        let filter = new_filter_fn(&schema.tag_filters)?;
        Ok(Self {
            name: schema.name,
            tombstoned: schema.tombstoned,
            cutover_nanos: schema.cutover_nanos,
            filter,
            raw_filters: schema.tag_filters,
            policies: schema.policies,
            last_updated_at_nanos: schema.last_updated_at_nanos,
            last_updated_by: schema.last_updated_by,
        })
    }

    pub(crate) fn to_schema(&self) -> MappingRuleSnapshotSchema {
        MappingRuleSnapshotSchema {
            name: self.name.clone(),
            tombstoned: self.tombstoned,
            cutover_nanos: self.cutover_nanos,
            tag_filters: self.raw_filters.clone(),
            policies: self.policies.clone(),
            last_updated_at_nanos: self.last_updated_at_nanos,
            last_updated_by: self.last_updated_by.clone(),
        }
    }

    fn to_view(&self, uuid: &str) -> MappingRuleView {
        MappingRuleView {
            id: uuid.to_string(),
            name: self.name.clone(),
            tombstoned: self.tombstoned,
            cutover_nanos: self.cutover_nanos,
            filters: self.raw_filters.clone(),
            policies: self.policies.clone(),
            last_updated_by: self.last_updated_by.clone(),
            last_updated_at_nanos: self.last_updated_at_nanos,
        }
    }

    /// Rule name at this snapshot
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this snapshot is a tombstone
    pub fn tombstoned(&self) -> bool {
        self.tombstoned
    }

    /// When this snapshot becomes authoritative
    pub fn cutover_nanos(&self) -> i64 {
        self.cutover_nanos
    }

    /// Aggregation policies at this snapshot
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }
}

/// A mapping rule: stable identity plus its full snapshot history
#[derive(Debug, Clone)]
pub struct MappingRule {
    pub(crate) uuid: String,
    pub(crate) snapshots: Vec<MappingRuleSnapshot>,
}

impl MappingRule {
    /// Create a fresh rule with a new uuid and a single snapshot
    pub(crate) fn from_fields(
        name: String,
        raw_filters: RawFilters,
        policies: Vec<Policy>,
        meta: &UpdateMetadata,
        new_filter_fn: &NewFilterFn,
    ) -> Result<Self> {
        let snapshot =
            MappingRuleSnapshot::from_fields(name, raw_filters, policies, meta, new_filter_fn)?;
        Ok(Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            snapshots: vec![snapshot],
        })
    }

    /// Rebuild a rule from its persisted history
    pub(crate) fn from_schema(
        schema: MappingRuleSchema,
        new_filter_fn: &NewFilterFn,
    ) -> Result<Self> {
        let snapshots = schema
            .snapshots
            .into_iter()
            .map(|s| MappingRuleSnapshot::from_schema(s, new_filter_fn))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            uuid: schema.uuid,
            snapshots,
        })
    }

    pub(crate) fn to_schema(&self) -> MappingRuleSchema {
        MappingRuleSchema {
            uuid: self.uuid.clone(),
            snapshots: self.snapshots.iter().map(|s| s.to_schema()).collect(),
        }
    }

    /// Stable rule identity across edits
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Index of the snapshot active at the given time, if any
    fn active_index(&self, time_nanos: i64) -> Option<usize> {
        let mut idx = self.snapshots.len();
        while idx > 0 && self.snapshots[idx - 1].cutover_nanos > time_nanos {
            idx -= 1;
        }
        idx.checked_sub(1)
    }

    /// The last snapshot with cutover <= the given time, if any
    pub fn active_snapshot(&self, time_nanos: i64) -> Option<&MappingRuleSnapshot> {
        self.active_index(time_nanos).map(|i| &self.snapshots[i])
    }

    /// A copy of this rule trimmed to the snapshots valid from the given
    /// time onwards
    ///
    /// Used when freezing a point-in-time view of the ruleset. If no
    /// snapshot is active yet the whole history is kept, since every
    /// snapshot is still in the future.
    pub fn active_rule(&self, time_nanos: i64) -> MappingRule {
        let start = self.active_index(time_nanos).unwrap_or(0);
        MappingRule {
            uuid: self.uuid.clone(),
            snapshots: self.snapshots[start..].to_vec(),
        }
    }

    fn append_snapshot(
        &mut self,
        name: String,
        raw_filters: RawFilters,
        policies: Vec<Policy>,
        meta: &UpdateMetadata,
        new_filter_fn: &NewFilterFn,
    ) -> Result<()> {
        let snapshot =
            MappingRuleSnapshot::from_fields(name, raw_filters, policies, meta, new_filter_fn)?;
        self.snapshots.push(snapshot);
        Ok(())
    }

    /// Append a new active snapshot; fails if the rule is tombstoned
    pub(crate) fn add_snapshot(
        &mut self,
        name: String,
        raw_filters: RawFilters,
        policies: Vec<Policy>,
        meta: &UpdateMetadata,
        new_filter_fn: &NewFilterFn,
    ) -> Result<()> {
        if self.tombstoned() {
            return Err(Error::AlreadyTombstoned(self.uuid.clone()));
        }
        self.append_snapshot(name, raw_filters, policies, meta, new_filter_fn)
    }

    /// Append a tombstoned snapshot carrying the previous filter and no
    /// policies
    pub(crate) fn mark_tombstoned(&mut self, cutover_nanos: i64) -> Result<()> {
        let last = match self.snapshots.last() {
            Some(last) => last,
            None => return Err(Error::NoRuleSnapshots),
        };
        if last.tombstoned {
            return Err(Error::AlreadyTombstoned(last.name.clone()));
        }
        let mut snapshot = last.clone();
        snapshot.tombstoned = true;
        snapshot.cutover_nanos = cutover_nanos;
        snapshot.policies = Vec::new();
        self.snapshots.push(snapshot);
        Ok(())
    }

    /// Un-tombstone the rule by appending a fresh active snapshot
    pub(crate) fn revive(
        &mut self,
        name: String,
        raw_filters: RawFilters,
        policies: Vec<Policy>,
        meta: &UpdateMetadata,
        new_filter_fn: &NewFilterFn,
    ) -> Result<()> {
        if self.snapshots.is_empty() {
            return Err(Error::NoRuleSnapshots);
        }
        if !self.tombstoned() {
            return Err(Error::NotTombstoned(self.uuid.clone()));
        }
        self.append_snapshot(name, raw_filters, policies, meta, new_filter_fn)
    }

    /// Current rule name, read off the latest snapshot
    pub fn name(&self) -> Result<&str> {
        match self.snapshots.last() {
            Some(last) => Ok(&last.name),
            None => Err(Error::NoRuleSnapshots),
        }
    }

    /// Whether the rule is currently tombstoned
    ///
    /// A rule without snapshots has no active state and reports tombstoned.
    pub fn tombstoned(&self) -> bool {
        match self.snapshots.last() {
            Some(last) => last.tombstoned,
            None => true,
        }
    }

    /// The rule's full edit history as views, most recent first
    pub fn history(&self) -> Result<Vec<MappingRuleView>> {
        if self.snapshots.is_empty() {
            return Err(Error::NoRuleSnapshots);
        }
        Ok(self
            .snapshots
            .iter()
            .rev()
            .map(|s| s.to_view(&self.uuid))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ruleset::testing::{test_meta, test_new_filter_fn};
    use std::collections::BTreeMap;

    fn raw_filters(pairs: &[(&str, &str)]) -> RawFilters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    }

    fn test_rule() -> MappingRule {
        MappingRule::from_fields(
            "cpu.all".to_string(),
            raw_filters(&[("dc", "east")]),
            vec![Policy::default()],
            &test_meta(1000),
            &test_new_filter_fn(),
        )
        .unwrap()
    }

    #[test]
    fn test_active_snapshot_before_first_cutover() {
        let rule = test_rule();
        assert!(rule.active_snapshot(999).is_none());
        assert!(rule.active_snapshot(1000).is_some());
    }

    #[test]
    fn test_active_snapshot_picks_latest_at_or_before() {
        let mut rule = test_rule();
        rule.add_snapshot(
            "cpu.all".to_string(),
            raw_filters(&[("dc", "west")]),
            vec![Policy::default()],
            &test_meta(2000),
            &test_new_filter_fn(),
        )
        .unwrap();

        assert_eq!(rule.active_snapshot(1500).unwrap().cutover_nanos(), 1000);
        assert_eq!(rule.active_snapshot(2000).unwrap().cutover_nanos(), 2000);
        assert_eq!(rule.active_snapshot(9999).unwrap().cutover_nanos(), 2000);
    }

    #[test]
    fn test_active_rule_trims_history() {
        let mut rule = test_rule();
        rule.add_snapshot(
            "cpu.all".to_string(),
            raw_filters(&[("dc", "west")]),
            vec![Policy::default()],
            &test_meta(2000),
            &test_new_filter_fn(),
        )
        .unwrap();

        let active = rule.active_rule(2500);
        assert_eq!(active.uuid(), rule.uuid());
        assert_eq!(active.snapshots.len(), 1);
        assert_eq!(active.snapshots[0].cutover_nanos(), 2000);

        // Nothing active yet: the whole history survives.
        let future = rule.active_rule(0);
        assert_eq!(future.snapshots.len(), 2);
    }

    #[test]
    fn test_tombstone_then_revive() {
        let mut rule = test_rule();
        assert!(!rule.tombstoned());

        rule.mark_tombstoned(3000).unwrap();
        assert!(rule.tombstoned());
        assert_eq!(rule.name().unwrap(), "cpu.all");
        // Tombstoned snapshot has no policies.
        assert!(rule.active_snapshot(3000).unwrap().policies().is_empty());

        // Double-tombstone is an invalid state transition.
        assert!(matches!(
            rule.mark_tombstoned(4000),
            Err(Error::AlreadyTombstoned(_))
        ));

        rule.revive(
            "cpu.all".to_string(),
            raw_filters(&[("dc", "east")]),
            vec![Policy::default()],
            &test_meta(5000),
            &test_new_filter_fn(),
        )
        .unwrap();
        assert!(!rule.tombstoned());

        // Reviving a live rule is also invalid.
        assert!(matches!(
            rule.revive(
                "cpu.all".to_string(),
                raw_filters(&[]),
                vec![],
                &test_meta(6000),
                &test_new_filter_fn(),
            ),
            Err(Error::NotTombstoned(_))
        ));
    }

    #[test]
    fn test_add_snapshot_on_tombstoned_rule_fails() {
        let mut rule = test_rule();
        rule.mark_tombstoned(3000).unwrap();
        assert!(matches!(
            rule.add_snapshot(
                "cpu.all".to_string(),
                raw_filters(&[]),
                vec![],
                &test_meta(4000),
                &test_new_filter_fn(),
            ),
            Err(Error::AlreadyTombstoned(_))
        ));
    }

    #[test]
    fn test_history_most_recent_first() {
        let mut rule = test_rule();
        rule.add_snapshot(
            "cpu.all.v2".to_string(),
            raw_filters(&[("dc", "west")]),
            vec![Policy::default()],
            &test_meta(2000),
            &test_new_filter_fn(),
        )
        .unwrap();

        let history = rule.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].name, "cpu.all.v2");
        assert_eq!(history[0].cutover_nanos, 2000);
        assert_eq!(history[1].name, "cpu.all");
        assert_eq!(history[1].id, rule.uuid());
    }

    #[test]
    fn test_clone_is_independent() {
        let rule = test_rule();
        let mut cloned = rule.clone();
        cloned.mark_tombstoned(3000).unwrap();
        assert!(cloned.tombstoned());
        assert!(!rule.tombstoned());
    }

    #[test]
    fn test_schema_round_trip() {
        let mut rule = test_rule();
        rule.mark_tombstoned(3000).unwrap();
        let schema = rule.to_schema();
        let rebuilt = MappingRule::from_schema(schema.clone(), &test_new_filter_fn()).unwrap();
        assert_eq!(rebuilt.to_schema(), schema);
    }
}
