//! Rollup rules
//!
//! A rollup rule associates a filter with one or more named, tag-projecting
//! transformations. Each matched metric is re-emitted under a synthesized
//! rollup id carrying only the target's tags, with the target's policies.
//! Like mapping rules, rollup rules are append-only snapshot histories.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::filter::{Filter, NewFilterFn, RawFilters};
use crate::policy::{PoliciesList, Policy};
use crate::rules::ruleset::UpdateMetadata;
use crate::rules::schema::{RollupRuleSchema, RollupRuleSnapshotSchema, RollupTargetSchema};
use crate::rules::view::{RollupRuleView, RollupTargetView};

/// A rollup transformation: derived metric name, preserved tags, policies
///
/// Two targets with the same name and tag list are the same transform
/// regardless of their policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupTarget {
    /// Name of the derived rollup metric
    pub name: Vec<u8>,
    /// Tag names preserved by the rollup, ascending
    pub tags: Vec<Vec<u8>>,
    /// Policies applied to the rollup output stream
    pub policies: Vec<Policy>,
}

impl RollupTarget {
    /// Create a target; tags are sorted ascending to uphold the matcher's
    /// ordering invariant
    pub fn new(name: Vec<u8>, mut tags: Vec<Vec<u8>>, policies: Vec<Policy>) -> Self {
        tags.sort();
        Self {
            name,
            tags,
            policies,
        }
    }

    pub(crate) fn from_view(view: RollupTargetView) -> Self {
        Self::new(
            view.name.into_bytes(),
            view.tags.into_iter().map(String::into_bytes).collect(),
            view.policies,
        )
    }

    pub(crate) fn from_schema(schema: RollupTargetSchema) -> Self {
        Self::new(
            schema.name.into_bytes(),
            schema.tags.into_iter().map(String::into_bytes).collect(),
            schema.policies,
        )
    }

    pub(crate) fn to_schema(&self) -> Result<RollupTargetSchema> {
        Ok(RollupTargetSchema {
            name: utf8(&self.name)?,
            tags: self.tags.iter().map(|t| utf8(t)).collect::<Result<_>>()?,
            policies: self.policies.clone(),
        })
    }

    pub(crate) fn to_view(&self) -> Result<RollupTargetView> {
        Ok(RollupTargetView {
            name: utf8(&self.name)?,
            tags: self.tags.iter().map(|t| utf8(t)).collect::<Result<_>>()?,
            policies: self.policies.clone(),
        })
    }

    /// Whether two targets define the same transform (same name and tags)
    pub fn same_transform(&self, other: &RollupTarget) -> bool {
        self.name == other.name && self.tags == other.tags
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::InvalidSchema("non-utf8 rollup target field".to_string()))
}

/// One rollup output stream and the evolution of its policies
///
/// Sequences of rollup results are kept ascending by id so merges across
/// cutover stages cost one ordered pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupResult {
    /// Synthesized rollup metric id
    pub id: Vec<u8>,
    /// How the stream's policies evolve over the matched interval
    pub policies_list: PoliciesList,
}

/// One immutable state of a rollup rule
#[derive(Debug, Clone)]
pub struct RollupRuleSnapshot {
    pub(crate) name: String,
    pub(crate) tombstoned: bool,
    pub(crate) cutover_nanos: i64,
    pub(crate) filter: Arc<dyn Filter>,
    pub(crate) raw_filters: RawFilters,
    pub(crate) targets: Vec<RollupTarget>,
    pub(crate) last_updated_at_nanos: i64,
    pub(crate) last_updated_by: String,
}

impl RollupRuleSnapshot {
    fn from_fields(
        name: String,
        raw_filters: RawFilters,
        targets: Vec<RollupTarget>,
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
            targets,
            last_updated_at_nanos: meta.updated_at_nanos(),
            last_updated_by: meta.updated_by().to_string(),
        })
    }

    pub(crate) fn from_schema(
        schema: RollupRuleSnapshotSchema,
        new_filter_fn: &NewFilterFn,
    ) -> Result<Self> {
        let filter = new_filter_fn(&schema.tag_filters)?;
        Ok(Self {
            name: schema.name,
            tombstoned: schema.tombstoned,
            cutover_nanos: schema.cutover_nanos,
            filter,
            raw_filters: schema.tag_filters,
            targets: schema
                .targets
                .into_iter()
                .map(RollupTarget::from_schema)
                .collect(),
            last_updated_at_nanos: schema.last_updated_at_nanos,
            last_updated_by: schema.last_updated_by,
        })
    }

    pub(crate) fn to_schema(&self) -> Result<RollupRuleSnapshotSchema> {
        Ok(RollupRuleSnapshotSchema {
            name: self.name.clone(),
            tombstoned: self.tombstoned,
            cutover_nanos: self.cutover_nanos,
            tag_filters: self.raw_filters.clone(),
            targets: self
                .targets
                .iter()
                .map(|t| t.to_schema())
                .collect::<Result<_>>()?,
            last_updated_at_nanos: self.last_updated_at_nanos,
            last_updated_by: self.last_updated_by.clone(),
        })
    }

    fn to_view(&self, uuid: &str) -> Result<RollupRuleView> {
        Ok(RollupRuleView {
            id: uuid.to_string(),
            name: self.name.clone(),
            tombstoned: self.tombstoned,
            cutover_nanos: self.cutover_nanos,
            filters: self.raw_filters.clone(),
            targets: self
                .targets
                .iter()
                .map(|t| t.to_view())
                .collect::<Result<_>>()?,
            last_updated_by: self.last_updated_by.clone(),
            last_updated_at_nanos: self.last_updated_at_nanos,
        })
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

    /// Rollup transformations at this snapshot
    pub fn targets(&self) -> &[RollupTarget] {
        &self.targets
    }
}

/// A rollup rule: stable identity plus its full snapshot history
#[derive(Debug, Clone)]
pub struct RollupRule {
    pub(crate) uuid: String,
    pub(crate) snapshots: Vec<RollupRuleSnapshot>,
}

impl RollupRule {
    /// Create a fresh rule with a new uuid and a single snapshot
    pub(crate) fn from_fields(
        name: String,
        raw_filters: RawFilters,
        targets: Vec<RollupTarget>,
        meta: &UpdateMetadata,
        new_filter_fn: &NewFilterFn,
    ) -> Result<Self> {
        let snapshot =
            RollupRuleSnapshot::from_fields(name, raw_filters, targets, meta, new_filter_fn)?;
        Ok(Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            snapshots: vec![snapshot],
        })
    }

    /// Rebuild a rule from its persisted history
    pub(crate) fn from_schema(
        schema: RollupRuleSchema,
        new_filter_fn: &NewFilterFn,
    ) -> Result<Self> {
        let snapshots = schema
            .snapshots
            .into_iter()
            .map(|s| RollupRuleSnapshot::from_schema(s, new_filter_fn))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            uuid: schema.uuid,
            snapshots,
        })
    }

    pub(crate) fn to_schema(&self) -> Result<RollupRuleSchema> {
        Ok(RollupRuleSchema {
            uuid: self.uuid.clone(),
            snapshots: self
                .snapshots
                .iter()
                .map(|s| s.to_schema())
                .collect::<Result<_>>()?,
        })
    }

    /// Stable rule identity across edits
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    fn active_index(&self, time_nanos: i64) -> Option<usize> {
        let mut idx = self.snapshots.len();
        while idx > 0 && self.snapshots[idx - 1].cutover_nanos > time_nanos {
            idx -= 1;
        }
        idx.checked_sub(1)
    }

    /// The last snapshot with cutover <= the given time, if any
    pub fn active_snapshot(&self, time_nanos: i64) -> Option<&RollupRuleSnapshot> {
        self.active_index(time_nanos).map(|i| &self.snapshots[i])
    }

    /// A copy of this rule trimmed to the snapshots valid from the given
    /// time onwards
    pub fn active_rule(&self, time_nanos: i64) -> RollupRule {
        let start = self.active_index(time_nanos).unwrap_or(0);
        RollupRule {
            uuid: self.uuid.clone(),
            snapshots: self.snapshots[start..].to_vec(),
        }
    }

    fn append_snapshot(
        &mut self,
        name: String,
        raw_filters: RawFilters,
        targets: Vec<RollupTarget>,
        meta: &UpdateMetadata,
        new_filter_fn: &NewFilterFn,
    ) -> Result<()> {
        let snapshot =
            RollupRuleSnapshot::from_fields(name, raw_filters, targets, meta, new_filter_fn)?;
        self.snapshots.push(snapshot);
        Ok(())
    }

    /// Append a new active snapshot; fails if the rule is tombstoned
    pub(crate) fn add_snapshot(
        &mut self,
        name: String,
        raw_filters: RawFilters,
        targets: Vec<RollupTarget>,
        meta: &UpdateMetadata,
        new_filter_fn: &NewFilterFn,
    ) -> Result<()> {
        if self.tombstoned() {
            return Err(Error::AlreadyTombstoned(self.uuid.clone()));
        }
        self.append_snapshot(name, raw_filters, targets, meta, new_filter_fn)
    }

    /// Append a tombstoned snapshot carrying the previous filter and no
    /// targets
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
        snapshot.targets = Vec::new();
        self.snapshots.push(snapshot);
        Ok(())
    }

    /// Un-tombstone the rule by appending a fresh active snapshot
    pub(crate) fn revive(
        &mut self,
        name: String,
        raw_filters: RawFilters,
        targets: Vec<RollupTarget>,
        meta: &UpdateMetadata,
        new_filter_fn: &NewFilterFn,
    ) -> Result<()> {
        if self.snapshots.is_empty() {
            return Err(Error::NoRuleSnapshots);
        }
        if !self.tombstoned() {
            return Err(Error::NotTombstoned(self.uuid.clone()));
        }
        self.append_snapshot(name, raw_filters, targets, meta, new_filter_fn)
    }

    /// Current rule name, read off the latest snapshot
    pub fn name(&self) -> Result<&str> {
        match self.snapshots.last() {
            Some(last) => Ok(&last.name),
            None => Err(Error::NoRuleSnapshots),
        }
    }

    /// Whether the rule is currently tombstoned
    pub fn tombstoned(&self) -> bool {
        match self.snapshots.last() {
            Some(last) => last.tombstoned,
            None => true,
        }
    }

    /// The rule's full edit history as views, most recent first
    pub fn history(&self) -> Result<Vec<RollupRuleView>> {
        if self.snapshots.is_empty() {
            return Err(Error::NoRuleSnapshots);
        }
        self.snapshots
            .iter()
            .rev()
            .map(|s| s.to_view(&self.uuid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AggregationId, Resolution, Retention};
    use crate::rules::ruleset::testing::{test_meta, test_new_filter_fn};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn raw_filters(pairs: &[(&str, &str)]) -> RawFilters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    }

    fn target(name: &str, tags: &[&str]) -> RollupTarget {
        RollupTarget::new(
            name.as_bytes().to_vec(),
            tags.iter().map(|t| t.as_bytes().to_vec()).collect(),
            vec![Policy::new(
                Resolution::from_duration(Duration::from_secs(60)),
                Retention::from_duration(Duration::from_secs(86400)),
                AggregationId::DEFAULT,
            )],
        )
    }

    fn test_rule() -> RollupRule {
        RollupRule::from_fields(
            "cpu.by_dc".to_string(),
            raw_filters(&[("dc", "*")]),
            vec![target("cpu.dc", &["dc"])],
            &test_meta(1000),
            &test_new_filter_fn(),
        )
        .unwrap()
    }

    #[test]
    fn test_target_tags_sorted_on_construction() {
        let t = target("cpu.dc", &["host", "dc"]);
        assert_eq!(t.tags, vec![b"dc".to_vec(), b"host".to_vec()]);
    }

    #[test]
    fn test_same_transform_ignores_policies() {
        let a = target("cpu.dc", &["dc"]);
        let mut b = target("cpu.dc", &["dc"]);
        b.policies.clear();
        assert!(a.same_transform(&b));
        assert!(!a.same_transform(&target("cpu.dc", &["dc", "host"])));
        assert!(!a.same_transform(&target("cpu.host", &["dc"])));
    }

    #[test]
    fn test_tombstone_clears_targets() {
        let mut rule = test_rule();
        rule.mark_tombstoned(3000).unwrap();
        assert!(rule.tombstoned());
        assert!(rule.active_snapshot(3000).unwrap().targets().is_empty());
        assert!(matches!(
            rule.mark_tombstoned(4000),
            Err(Error::AlreadyTombstoned(_))
        ));
    }

    #[test]
    fn test_revive_requires_tombstone() {
        let mut rule = test_rule();
        assert!(matches!(
            rule.revive(
                "cpu.by_dc".to_string(),
                raw_filters(&[]),
                vec![],
                &test_meta(2000),
                &test_new_filter_fn(),
            ),
            Err(Error::NotTombstoned(_))
        ));

        rule.mark_tombstoned(3000).unwrap();
        rule.revive(
            "cpu.by_dc".to_string(),
            raw_filters(&[("dc", "*")]),
            vec![target("cpu.dc", &["dc"])],
            &test_meta(4000),
            &test_new_filter_fn(),
        )
        .unwrap();
        assert!(!rule.tombstoned());
    }

    #[test]
    fn test_history_and_schema_round_trip() {
        let mut rule = test_rule();
        rule.add_snapshot(
            "cpu.by_dc".to_string(),
            raw_filters(&[("dc", "*"), ("env", "prod")]),
            vec![target("cpu.dc", &["dc"]), target("cpu.dc_env", &["dc", "env"])],
            &test_meta(2000),
            &test_new_filter_fn(),
        )
        .unwrap();

        let history = rule.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].cutover_nanos, 2000);
        assert_eq!(history[0].targets.len(), 2);

        let schema = rule.to_schema().unwrap();
        let rebuilt = RollupRule::from_schema(schema.clone(), &test_new_filter_fn()).unwrap();
        assert_eq!(rebuilt.to_schema().unwrap(), schema);
    }
}
