//! Rulesets
//!
//! A [`RuleSet`] is the mutable aggregate of all mapping and rollup rules
//! for one namespace. Mutations validate conflicts, append snapshots (never
//! rewriting history), and stamp update metadata; [`RuleSet::active_set`]
//! freezes a point-in-time [`ActiveRuleSet`] for matching.
//!
//! The intended concurrency discipline is copy-on-write: stage mutations on
//! a [`RuleSet::clone`], then publish the staged copy by swapping whatever
//! shared reference readers go through. Active rule sets hold their own
//! trimmed copies of the rules, so in-flight matching never observes a
//! concurrent publish.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::filter::{Filter, NewFilterFn, RawFilters, TagFilterOptions, TagsFilter};
use crate::id::{self, IsRollupIdFn, NewRollupIdFn};
use crate::rules::active::ActiveRuleSet;
use crate::rules::mapping::MappingRule;
use crate::rules::rollup::{RollupRule, RollupTarget};
use crate::rules::schema::RuleSetSchema;
use crate::rules::view::{MappingRuleView, RollupRuleView};

/// Version of a ruleset that has never been persisted
pub const UNINITIALIZED_RULE_SET_VERSION: i32 = 0;

/// Descriptive information stamped onto the ruleset by every mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMetadata {
    cutover_nanos: i64,
    updated_at_nanos: i64,
    updated_by: String,
}

impl UpdateMetadata {
    /// Create update metadata directly; prefer
    /// [`RuleSetUpdateHelper::new_update_metadata`] which applies the
    /// configured propagation delay
    pub fn new(cutover_nanos: i64, updated_at_nanos: i64, updated_by: impl Into<String>) -> Self {
        Self {
            cutover_nanos,
            updated_at_nanos,
            updated_by: updated_by.into(),
        }
    }

    /// When the change becomes authoritative
    pub fn cutover_nanos(&self) -> i64 {
        self.cutover_nanos
    }

    /// When the change was made
    pub fn updated_at_nanos(&self) -> i64 {
        self.updated_at_nanos
    }

    /// Who made the change
    pub fn updated_by(&self) -> &str {
        &self.updated_by
    }
}

/// Builds [`UpdateMetadata`] with the configured propagation delay
///
/// The cutover of a change is pushed past its update time by the delay so
/// every consumer of the ruleset has seen the new version before it takes
/// effect.
#[derive(Debug, Clone, Copy)]
pub struct RuleSetUpdateHelper {
    propagation_delay: Duration,
}

impl RuleSetUpdateHelper {
    /// Create a helper with the given propagation delay
    pub fn new(propagation_delay: Duration) -> Self {
        Self { propagation_delay }
    }

    /// Create update metadata for a change made at the given time
    pub fn new_update_metadata(
        &self,
        update_time_nanos: i64,
        updated_by: impl Into<String>,
    ) -> UpdateMetadata {
        let cutover_nanos = update_time_nanos + self.propagation_delay.as_nanos() as i64;
        UpdateMetadata::new(cutover_nanos, update_time_nanos, updated_by)
    }
}

/// Capabilities injected into rulesets at construction time
///
/// The defaults use the reference id codec and the reference conjunctive
/// tags filter; production deployments inject their own id decomposition,
/// rollup id synthesis, and filter compilation.
#[derive(Clone)]
pub struct Options {
    /// Id decomposition capabilities
    pub tag_filter_options: TagFilterOptions,
    /// Synthesizes rollup metric ids
    pub new_rollup_id_fn: NewRollupIdFn,
    /// Classifies decomposed ids as rollup outputs
    pub is_rollup_id_fn: IsRollupIdFn,
    /// Compiles raw tag filters
    pub new_filter_fn: NewFilterFn,
}

impl Options {
    /// Replace the id decomposition capabilities
    pub fn with_tag_filter_options(mut self, opts: TagFilterOptions) -> Self {
        self.tag_filter_options = opts;
        self
    }

    /// Replace the rollup id synthesis capability
    pub fn with_new_rollup_id_fn(mut self, f: NewRollupIdFn) -> Self {
        self.new_rollup_id_fn = f;
        self
    }

    /// Replace the rollup id classification capability
    pub fn with_is_rollup_id_fn(mut self, f: IsRollupIdFn) -> Self {
        self.is_rollup_id_fn = f;
        self
    }

    /// Replace the filter compilation capability
    pub fn with_new_filter_fn(mut self, f: NewFilterFn) -> Self {
        self.new_filter_fn = f;
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        let tag_filter_options = TagFilterOptions::new(
            Arc::new(id::parse_name_and_tags),
            Arc::new(id::simple_sorted_tag_iterator),
        );
        let filter_opts = tag_filter_options.clone();
        Self {
            tag_filter_options,
            new_rollup_id_fn: Arc::new(id::simple_rollup_id),
            is_rollup_id_fn: Arc::new(id::is_simple_rollup_id),
            new_filter_fn: Arc::new(move |raw: &RawFilters| -> Result<Arc<dyn Filter>> {
                let filter = TagsFilter::new(raw, filter_opts.clone())?;
                Ok(Arc::new(filter))
            }),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options").finish_non_exhaustive()
    }
}

/// All mapping rule histories in a ruleset, indexed by rule uuid
pub type MappingRules = HashMap<String, Vec<MappingRuleView>>;

/// All rollup rule histories in a ruleset, indexed by rule uuid
pub type RollupRules = HashMap<String, Vec<RollupRuleView>>;

/// The mutable aggregate of all rules for one namespace
#[derive(Debug, Clone)]
pub struct RuleSet {
    uuid: String,
    version: i32,
    namespace: Vec<u8>,
    created_at_nanos: i64,
    last_updated_at_nanos: i64,
    last_updated_by: String,
    tombstoned: bool,
    cutover_nanos: i64,
    mapping_rules: Vec<MappingRule>,
    rollup_rules: Vec<RollupRule>,
    opts: Options,
}

impl RuleSet {
    /// Rebuild a ruleset from its persisted schema
    ///
    /// The version is caller-supplied: it comes from the store the schema
    /// was fetched from, not from the record itself.
    pub fn from_schema(
        version: i32,
        schema: Option<RuleSetSchema>,
        opts: Options,
    ) -> Result<Self> {
        let schema = schema.ok_or(Error::NilRuleSetSchema)?;
        let mapping_rules = schema
            .mapping_rules
            .into_iter()
            .map(|r| MappingRule::from_schema(r, &opts.new_filter_fn))
            .collect::<Result<Vec<_>>>()?;
        let rollup_rules = schema
            .rollup_rules
            .into_iter()
            .map(|r| RollupRule::from_schema(r, &opts.new_filter_fn))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            uuid: schema.uuid,
            version,
            namespace: schema.namespace.into_bytes(),
            created_at_nanos: schema.created_at_nanos,
            last_updated_at_nanos: schema.last_updated_at_nanos,
            last_updated_by: schema.last_updated_by,
            tombstoned: schema.tombstoned,
            cutover_nanos: schema.cutover_nanos,
            mapping_rules,
            rollup_rules,
            opts,
        })
    }

    /// Create an empty ruleset for a new namespace
    pub fn new_empty(namespace: &str, meta: UpdateMetadata, opts: Options) -> Self {
        let mut rs = Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            version: UNINITIALIZED_RULE_SET_VERSION,
            namespace: namespace.as_bytes().to_vec(),
            created_at_nanos: meta.updated_at_nanos,
            last_updated_at_nanos: 0,
            last_updated_by: String::new(),
            tombstoned: false,
            cutover_nanos: 0,
            mapping_rules: Vec::new(),
            rollup_rules: Vec::new(),
            opts,
        };
        rs.update_metadata(&meta);
        rs
    }

    /// Ruleset identity
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The metrics namespace the ruleset applies to
    pub fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    /// The ruleset version
    pub fn version(&self) -> i32 {
        self.version
    }

    /// When the ruleset takes effect
    pub fn cutover_nanos(&self) -> i64 {
        self.cutover_nanos
    }

    /// Whether the ruleset is tombstoned
    pub fn tombstoned(&self) -> bool {
        self.tombstoned
    }

    /// When the ruleset was created
    pub fn created_at_nanos(&self) -> i64 {
        self.created_at_nanos
    }

    /// When the ruleset was last updated
    pub fn last_updated_at_nanos(&self) -> i64 {
        self.last_updated_at_nanos
    }

    /// Who last updated the ruleset
    pub fn last_updated_by(&self) -> &str {
        &self.last_updated_by
    }

    /// Freeze the ruleset at the given time for matching
    ///
    /// Each rule is trimmed to its history valid from that time onwards;
    /// the frozen view owns the trimmed copies and stays valid across
    /// subsequent mutations of this ruleset.
    pub fn active_set(&self, time_nanos: i64) -> ActiveRuleSet {
        let mapping_rules = self
            .mapping_rules
            .iter()
            .map(|r| r.active_rule(time_nanos))
            .collect();
        let rollup_rules = self
            .rollup_rules
            .iter()
            .map(|r| r.active_rule(time_nanos))
            .collect();
        ActiveRuleSet::new(
            self.version,
            mapping_rules,
            rollup_rules,
            self.opts.tag_filter_options.clone(),
            self.opts.new_rollup_id_fn.clone(),
            self.opts.is_rollup_id_fn.clone(),
        )
    }

    /// The persisted representation of this ruleset
    pub fn to_schema(&self) -> Result<RuleSetSchema> {
        let namespace = String::from_utf8(self.namespace.clone())
            .map_err(|_| Error::InvalidSchema("non-utf8 namespace".to_string()))?;
        Ok(RuleSetSchema {
            uuid: self.uuid.clone(),
            namespace,
            created_at_nanos: self.created_at_nanos,
            last_updated_at_nanos: self.last_updated_at_nanos,
            last_updated_by: self.last_updated_by.clone(),
            tombstoned: self.tombstoned,
            cutover_nanos: self.cutover_nanos,
            mapping_rules: self.mapping_rules.iter().map(|r| r.to_schema()).collect(),
            rollup_rules: self
                .rollup_rules
                .iter()
                .map(|r| r.to_schema())
                .collect::<Result<_>>()?,
        })
    }

    /// Every mapping rule's history, indexed by rule uuid
    pub fn mapping_rules(&self) -> Result<MappingRules> {
        let mut rules = MappingRules::with_capacity(self.mapping_rules.len());
        for rule in &self.mapping_rules {
            rules.insert(rule.uuid().to_string(), rule.history()?);
        }
        Ok(rules)
    }

    /// Every rollup rule's history, indexed by rule uuid
    pub fn rollup_rules(&self) -> Result<RollupRules> {
        let mut rules = RollupRules::with_capacity(self.rollup_rules.len());
        for rule in &self.rollup_rules {
            rules.insert(rule.uuid().to_string(), rule.history()?);
        }
        Ok(rules)
    }

    /// Create a new mapping rule, or revive a tombstoned rule of the same
    /// name in place; returns the rule's uuid
    pub fn add_mapping_rule(
        &mut self,
        view: MappingRuleView,
        meta: UpdateMetadata,
    ) -> Result<String> {
        self.validate_mapping_rule_update(&view)?;
        let new_filter_fn = self.opts.new_filter_fn.clone();

        let uuid = match self.mapping_rule_index_by_name(&view.name) {
            None => {
                let rule = MappingRule::from_fields(
                    view.name.clone(),
                    view.filters,
                    view.policies,
                    &meta,
                    &new_filter_fn,
                )
                .map_err(|e| e.for_rule_action("add", view.name.clone()))?;
                let uuid = rule.uuid().to_string();
                self.mapping_rules.push(rule);
                uuid
            }
            // Only a tombstoned rule can carry this name past validation;
            // revive it in place to preserve its uuid and history.
            Some(idx) => {
                let rule = &mut self.mapping_rules[idx];
                rule.revive(
                    view.name.clone(),
                    view.filters,
                    view.policies,
                    &meta,
                    &new_filter_fn,
                )
                .map_err(|e| e.for_rule_action("revive", view.name.clone()))?;
                rule.uuid().to_string()
            }
        };
        self.update_metadata(&meta);
        debug!(namespace = %String::from_utf8_lossy(&self.namespace), rule = %uuid, "added mapping rule");
        Ok(uuid)
    }

    /// Append a new snapshot to the mapping rule with the view's uuid
    pub fn update_mapping_rule(
        &mut self,
        view: MappingRuleView,
        meta: UpdateMetadata,
    ) -> Result<()> {
        self.validate_mapping_rule_update(&view)?;
        let new_filter_fn = self.opts.new_filter_fn.clone();
        let idx = self
            .mapping_rule_index_by_uuid(&view.id)
            .ok_or_else(|| Error::NoSuchRule.for_rule_action("update", view.id.clone()))?;
        self.mapping_rules[idx]
            .add_snapshot(
                view.name.clone(),
                view.filters,
                view.policies,
                &meta,
                &new_filter_fn,
            )
            .map_err(|e| e.for_rule_action("update", view.name))?;
        self.update_metadata(&meta);
        debug!(namespace = %String::from_utf8_lossy(&self.namespace), rule = %view.id, "updated mapping rule");
        Ok(())
    }

    /// Tombstone the mapping rule with the given uuid
    pub fn delete_mapping_rule(&mut self, id: &str, meta: UpdateMetadata) -> Result<()> {
        let idx = self
            .mapping_rule_index_by_uuid(id)
            .ok_or_else(|| Error::NoSuchRule.for_rule_action("delete", id.to_string()))?;
        self.mapping_rules[idx]
            .mark_tombstoned(meta.cutover_nanos)
            .map_err(|e| e.for_rule_action("delete", id.to_string()))?;
        self.update_metadata(&meta);
        debug!(namespace = %String::from_utf8_lossy(&self.namespace), rule = %id, "deleted mapping rule");
        Ok(())
    }

    /// Create a new rollup rule, or revive a tombstoned rule of the same
    /// name in place; returns the rule's uuid
    pub fn add_rollup_rule(
        &mut self,
        view: RollupRuleView,
        meta: UpdateMetadata,
    ) -> Result<String> {
        self.validate_rollup_rule_update(&view)?;
        let new_filter_fn = self.opts.new_filter_fn.clone();
        let targets: Vec<RollupTarget> = view
            .targets
            .into_iter()
            .map(RollupTarget::from_view)
            .collect();

        let uuid = match self.rollup_rule_index_by_name(&view.name) {
            None => {
                let rule = RollupRule::from_fields(
                    view.name.clone(),
                    view.filters,
                    targets,
                    &meta,
                    &new_filter_fn,
                )
                .map_err(|e| e.for_rule_action("add", view.name.clone()))?;
                let uuid = rule.uuid().to_string();
                self.rollup_rules.push(rule);
                uuid
            }
            Some(idx) => {
                let rule = &mut self.rollup_rules[idx];
                rule.revive(view.name.clone(), view.filters, targets, &meta, &new_filter_fn)
                    .map_err(|e| e.for_rule_action("revive", view.name.clone()))?;
                rule.uuid().to_string()
            }
        };
        self.update_metadata(&meta);
        debug!(namespace = %String::from_utf8_lossy(&self.namespace), rule = %uuid, "added rollup rule");
        Ok(uuid)
    }

    /// Append a new snapshot to the rollup rule with the view's uuid
    pub fn update_rollup_rule(
        &mut self,
        view: RollupRuleView,
        meta: UpdateMetadata,
    ) -> Result<()> {
        self.validate_rollup_rule_update(&view)?;
        let new_filter_fn = self.opts.new_filter_fn.clone();
        let targets: Vec<RollupTarget> = view
            .targets
            .into_iter()
            .map(RollupTarget::from_view)
            .collect();
        let idx = self
            .rollup_rule_index_by_uuid(&view.id)
            .ok_or_else(|| Error::NoSuchRule.for_rule_action("update", view.id.clone()))?;
        self.rollup_rules[idx]
            .add_snapshot(view.name.clone(), view.filters, targets, &meta, &new_filter_fn)
            .map_err(|e| e.for_rule_action("update", view.name))?;
        self.update_metadata(&meta);
        debug!(namespace = %String::from_utf8_lossy(&self.namespace), rule = %view.id, "updated rollup rule");
        Ok(())
    }

    /// Tombstone the rollup rule with the given uuid
    pub fn delete_rollup_rule(&mut self, id: &str, meta: UpdateMetadata) -> Result<()> {
        let idx = self
            .rollup_rule_index_by_uuid(id)
            .ok_or_else(|| Error::NoSuchRule.for_rule_action("delete", id.to_string()))?;
        self.rollup_rules[idx]
            .mark_tombstoned(meta.cutover_nanos)
            .map_err(|e| e.for_rule_action("delete", id.to_string()))?;
        self.update_metadata(&meta);
        debug!(namespace = %String::from_utf8_lossy(&self.namespace), rule = %id, "deleted rollup rule");
        Ok(())
    }

    /// Tombstone the ruleset and every non-tombstoned rule in it
    pub fn delete(&mut self, meta: UpdateMetadata) -> Result<()> {
        let namespace = String::from_utf8_lossy(&self.namespace).into_owned();
        if self.tombstoned {
            return Err(
                Error::AlreadyTombstoned(namespace.clone()).for_ruleset_action("delete", namespace)
            );
        }

        self.tombstoned = true;
        self.update_metadata(&meta);

        // Cascade to the rules; rules already tombstoned are left as is.
        for rule in &mut self.mapping_rules {
            if !rule.tombstoned() {
                let _ = rule.mark_tombstoned(meta.cutover_nanos);
            }
        }
        for rule in &mut self.rollup_rules {
            if !rule.tombstoned() {
                let _ = rule.mark_tombstoned(meta.cutover_nanos);
            }
        }
        debug!(namespace = %namespace, "deleted ruleset");
        Ok(())
    }

    /// Remove the ruleset's tombstone; does not revive any rules
    pub fn revive(&mut self, meta: UpdateMetadata) -> Result<()> {
        let namespace = String::from_utf8_lossy(&self.namespace).into_owned();
        if !self.tombstoned {
            return Err(
                Error::NotTombstoned(namespace.clone()).for_ruleset_action("revive", namespace)
            );
        }
        self.tombstoned = false;
        self.update_metadata(&meta);
        debug!(namespace = %namespace, "revived ruleset");
        Ok(())
    }

    fn update_metadata(&mut self, meta: &UpdateMetadata) {
        self.cutover_nanos = meta.cutover_nanos;
        self.last_updated_at_nanos = meta.updated_at_nanos;
        self.last_updated_by = meta.updated_by.clone();
    }

    fn mapping_rule_index_by_name(&self, name: &str) -> Option<usize> {
        self.mapping_rules
            .iter()
            .position(|r| matches!(r.name(), Ok(n) if n == name))
    }

    fn mapping_rule_index_by_uuid(&self, uuid: &str) -> Option<usize> {
        self.mapping_rules.iter().position(|r| r.uuid() == uuid)
    }

    fn rollup_rule_index_by_name(&self, name: &str) -> Option<usize> {
        self.rollup_rules
            .iter()
            .position(|r| matches!(r.name(), Ok(n) if n == name))
    }

    fn rollup_rule_index_by_uuid(&self, uuid: &str) -> Option<usize> {
        self.rollup_rules.iter().position(|r| r.uuid() == uuid)
    }

    fn validate_mapping_rule_update(&self, view: &MappingRuleView) -> Result<()> {
        for rule in &self.mapping_rules {
            if rule.tombstoned() {
                continue;
            }
            let name = rule.name()?;
            // The rule being updated keeping its own name is fine.
            if name == view.name && rule.uuid() != view.id {
                return Err(Error::RuleConflict {
                    conflicting_rule_uuid: rule.uuid().to_string(),
                    reason: format!("rule with name {} already exists", name),
                });
            }
        }
        Ok(())
    }

    fn validate_rollup_rule_update(&self, view: &RollupRuleView) -> Result<()> {
        let new_targets: Vec<RollupTarget> = view
            .targets
            .iter()
            .cloned()
            .map(RollupTarget::from_view)
            .collect();
        for rule in &self.rollup_rules {
            if rule.tombstoned() {
                continue;
            }
            let name = rule.name()?;
            if rule.uuid() == view.id {
                continue;
            }
            if name == view.name {
                return Err(Error::RuleConflict {
                    conflicting_rule_uuid: rule.uuid().to_string(),
                    reason: format!("rule with name {} already exists", name),
                });
            }
            let latest = match rule.snapshots.last() {
                Some(latest) => latest,
                None => continue,
            };
            for existing in latest.targets() {
                for target in &new_targets {
                    if existing.same_transform(target) {
                        return Err(Error::RuleConflict {
                            conflicting_rule_uuid: rule.uuid().to_string(),
                            reason: format!(
                                "same rollup transformation {} already exists",
                                String::from_utf8_lossy(&existing.name)
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
