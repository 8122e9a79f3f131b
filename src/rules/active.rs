//! Point-in-time rule matching
//!
//! An [`ActiveRuleSet`] is a projection of a ruleset frozen at a single
//! instant of the mutable structure. It answers "which policies apply to
//! this id over `[from_nanos, to_nanos)`" by walking the merged cutover
//! timeline of every rule snapshot and resolving mapping and rollup
//! policies at each transition.
//!
//! Matching runs per ingested datapoint, so per-instant resolution is a
//! single pass over the rules and every cross-stage merge is an ordered
//! merge over already-sorted sequences.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::filter::TagFilterOptions;
use crate::id::{IsRollupIdFn, NewRollupIdFn, TagPair};
use crate::policy::{resolve_policies, PoliciesList, StagedPolicies};
use crate::rules::mapping::MappingRule;
use crate::rules::rollup::{RollupResult, RollupRule, RollupTarget};

const TIME_NANOS_MAX: i64 = i64::MAX;

/// How a match is performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Match the id against both mapping and rollup rules to find the
    /// applicable mapping policies and rollup outputs
    Forward,
    /// Find the applicable mapping policies for an id that may itself be a
    /// rollup output
    Reverse,
}

impl FromStr for MatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(MatchMode::Forward),
            "reverse" => Ok(MatchMode::Reverse),
            other => Err(Error::UnknownMatchMode(other.to_string())),
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Forward => write!(f, "forward"),
            MatchMode::Reverse => write!(f, "reverse"),
        }
    }
}

/// Matches metric ids against rules to determine applicable policies
pub trait Matcher {
    /// The applicable policies for a metric id between `[from_nanos, to_nanos)`
    fn match_all(&self, id: &[u8], from_nanos: i64, to_nanos: i64, mode: MatchMode) -> MatchResult;
}

/// The outcome of matching one id over an interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    version: i32,
    expire_at_nanos: i64,
    mappings: PoliciesList,
    rollups: Vec<RollupResult>,
}

impl MatchResult {
    /// Create a new match result
    pub fn new(
        version: i32,
        expire_at_nanos: i64,
        mappings: PoliciesList,
        rollups: Vec<RollupResult>,
    ) -> Self {
        Self {
            version,
            expire_at_nanos,
            mappings,
            rollups,
        }
    }

    /// The ruleset version the result was derived from
    pub fn version(&self) -> i32 {
        self.version
    }

    /// The first cutover time at or after the match interval's end
    ///
    /// The result expires at this instant because the metric may then match
    /// a different set of rules; callers must re-match from there.
    pub fn expire_at_nanos(&self) -> i64 {
        self.expire_at_nanos
    }

    /// Whether the result has expired at the given time
    pub fn has_expired(&self, time_nanos: i64) -> bool {
        time_nanos >= self.expire_at_nanos
    }

    /// Mapping policy stages covering the interval, ascending by cutover
    pub fn mappings(&self) -> &PoliciesList {
        &self.mappings
    }

    /// Rollup outputs and their policy stages, ascending by rollup id
    pub fn rollups(&self) -> &[RollupResult] {
        &self.rollups
    }
}

/// A point-in-time-frozen projection of all rules in a ruleset
///
/// Holds its own trimmed copies of the active rules, so it stays valid when
/// the ruleset it was derived from is mutated afterwards.
pub struct ActiveRuleSet {
    version: i32,
    mapping_rules: Vec<MappingRule>,
    rollup_rules: Vec<RollupRule>,
    cutover_times_asc: Vec<i64>,
    tag_filter_opts: TagFilterOptions,
    new_rollup_id_fn: NewRollupIdFn,
    is_rollup_id_fn: IsRollupIdFn,
}

impl ActiveRuleSet {
    /// Build an active rule set over the given rules
    ///
    /// Collects every distinct cutover time appearing in any snapshot into
    /// the deduplicated ascending timeline the interval walk steps through.
    pub fn new(
        version: i32,
        mapping_rules: Vec<MappingRule>,
        rollup_rules: Vec<RollupRule>,
        tag_filter_opts: TagFilterOptions,
        new_rollup_id_fn: NewRollupIdFn,
        is_rollup_id_fn: IsRollupIdFn,
    ) -> Self {
        let mut unique_cutovers = BTreeSet::new();
        for rule in &mapping_rules {
            for snapshot in &rule.snapshots {
                unique_cutovers.insert(snapshot.cutover_nanos);
            }
        }
        for rule in &rollup_rules {
            for snapshot in &rule.snapshots {
                unique_cutovers.insert(snapshot.cutover_nanos);
            }
        }
        Self {
            version,
            mapping_rules,
            rollup_rules,
            cutover_times_asc: unique_cutovers.into_iter().collect(),
            tag_filter_opts,
            new_rollup_id_fn,
            is_rollup_id_fn,
        }
    }

    fn match_all_forward(&self, id: &[u8], from_nanos: i64, to_nanos: i64) -> MatchResult {
        let mut next_idx = self.next_cutover_idx(from_nanos);
        let mut next_cutover_nanos = self.cutover_nanos_at(next_idx);
        let mut mappings: PoliciesList = vec![self.mappings_for_non_rollup_id(id, from_nanos)];
        let mut rollups = self.rollup_results_for(id, from_nanos);

        while next_idx < self.cutover_times_asc.len() && next_cutover_nanos < to_nanos {
            let next_mappings = self.mappings_for_non_rollup_id(id, next_cutover_nanos);
            merge_mapping_results(&mut mappings, next_mappings);
            let next_rollups = self.rollup_results_for(id, next_cutover_nanos);
            rollups = merge_rollup_results(rollups, next_rollups, next_cutover_nanos);
            next_idx += 1;
            next_cutover_nanos = self.cutover_nanos_at(next_idx);
        }

        // The result expires at the first cutover after the interval since
        // the id may then match a different set of rules.
        MatchResult::new(self.version, next_cutover_nanos, mappings, rollups)
    }

    fn match_all_reverse(&self, id: &[u8], from_nanos: i64, to_nanos: i64) -> MatchResult {
        let mut next_idx = self.next_cutover_idx(from_nanos);
        let mut next_cutover_nanos = self.cutover_nanos_at(next_idx);
        let mut mappings: PoliciesList = Vec::new();

        // Classify the id; a decomposition failure degrades to non-rollup
        // treatment rather than aborting the match.
        let (name, tags, is_rollup_id) = match (self.tag_filter_opts.name_and_tags_fn)(id) {
            Ok((name, tags)) => (name, tags, (self.is_rollup_id_fn)(name, tags)),
            Err(err) => {
                warn!(
                    id = %String::from_utf8_lossy(id),
                    error = %err,
                    "failed to decompose metric id, treating as non-rollup"
                );
                (&[][..], &[][..], false)
            }
        };

        if let Some(staged) = self.reverse_mappings_for(id, name, tags, is_rollup_id, from_nanos) {
            mappings.push(staged);
        }
        while next_idx < self.cutover_times_asc.len() && next_cutover_nanos < to_nanos {
            if let Some(staged) =
                self.reverse_mappings_for(id, name, tags, is_rollup_id, next_cutover_nanos)
            {
                merge_mapping_results(&mut mappings, staged);
            }
            next_idx += 1;
            next_cutover_nanos = self.cutover_nanos_at(next_idx);
        }

        MatchResult::new(self.version, next_cutover_nanos, mappings, Vec::new())
    }

    fn reverse_mappings_for(
        &self,
        id: &[u8],
        name: &[u8],
        tags: &[u8],
        is_rollup_id: bool,
        time_nanos: i64,
    ) -> Option<StagedPolicies> {
        if !is_rollup_id {
            return Some(self.mappings_for_non_rollup_id(id, time_nanos));
        }
        self.mappings_for_rollup_id(name, tags, time_nanos)
    }

    /// Mapping policies for a rollup id at one instant
    ///
    /// A rollup id already encodes one finalized rollup target, so its
    /// policies come from the unique rule target whose name matches and
    /// whose tag list is a subset of the id's tags. Uniqueness is enforced
    /// at mutation time by the duplicate-transform validation; at most one
    /// target may match here.
    fn mappings_for_rollup_id(
        &self,
        name: &[u8],
        tags: &[u8],
        time_nanos: i64,
    ) -> Option<StagedPolicies> {
        let mut matched: Option<StagedPolicies> = None;
        for rule in &self.rollup_rules {
            let snapshot = match rule.active_snapshot(time_nanos) {
                Some(snapshot) => snapshot,
                None => continue,
            };
            for target in snapshot.targets() {
                if target.name != name {
                    continue;
                }
                if self.match_target_tags(tags, target).is_none() {
                    continue;
                }
                debug_assert!(
                    matched.is_none(),
                    "multiple rollup targets matched one rollup id"
                );
                if matched.is_none() {
                    let resolved = resolve_policies(target.policies.clone());
                    matched = Some(StagedPolicies::new(
                        snapshot.cutover_nanos(),
                        false,
                        resolved,
                    ));
                    if !cfg!(debug_assertions) {
                        return matched;
                    }
                }
            }
        }
        matched
    }

    /// Mapping policies for a raw (non-rollup) id at one instant
    ///
    /// Accumulates the policies of every mapping rule whose active snapshot
    /// filter matches the id, tracking the largest contributing cutover.
    /// Returns the default sentinel when nothing matched.
    fn mappings_for_non_rollup_id(&self, id: &[u8], time_nanos: i64) -> StagedPolicies {
        let mut cutover_nanos = 0;
        let mut policies = Vec::new();
        for rule in &self.mapping_rules {
            let snapshot = match rule.active_snapshot(time_nanos) {
                Some(snapshot) => snapshot,
                None => continue,
            };
            if !snapshot.filter.matches(id) {
                continue;
            }
            if cutover_nanos < snapshot.cutover_nanos {
                cutover_nanos = snapshot.cutover_nanos;
            }
            policies.extend_from_slice(&snapshot.policies);
        }
        if cutover_nanos == 0 && policies.is_empty() {
            return StagedPolicies::default_staged();
        }
        StagedPolicies::new(cutover_nanos, false, resolve_policies(policies))
    }

    /// Rollup outputs for a raw id at one instant
    ///
    /// Targets sharing the same transform across matched rules merge their
    /// policy lists; each merged target then resolves its policies and is
    /// converted into a rollup result with a synthesized id.
    fn rollup_results_for(&self, id: &[u8], time_nanos: i64) -> Vec<RollupResult> {
        let mut cutover_nanos = 0;
        let mut rollups: Vec<RollupTarget> = Vec::new();
        for rule in &self.rollup_rules {
            let snapshot = match rule.active_snapshot(time_nanos) {
                Some(snapshot) => snapshot,
                None => continue,
            };
            if !snapshot.filter.matches(id) {
                continue;
            }
            if cutover_nanos < snapshot.cutover_nanos {
                cutover_nanos = snapshot.cutover_nanos;
            }
            for target in snapshot.targets() {
                match rollups.iter_mut().find(|r| r.same_transform(target)) {
                    // Same transform as an existing target: merge policies.
                    Some(existing) => existing.policies.extend_from_slice(&target.policies),
                    None => rollups.push(target.clone()),
                }
            }
        }

        if rollups.is_empty() {
            return Vec::new();
        }
        for rollup in &mut rollups {
            rollup.policies = resolve_policies(std::mem::take(&mut rollup.policies));
        }
        self.to_rollup_results(id, cutover_nanos, rollups)
    }

    /// Encode target names and extracted tag values into rollup result ids
    fn to_rollup_results(
        &self,
        id: &[u8],
        cutover_nanos: i64,
        targets: Vec<RollupTarget>,
    ) -> Vec<RollupResult> {
        if targets.is_empty() {
            return Vec::new();
        }

        // An id we cannot decompose is likely invalid; it must not abort
        // matching for the rest of the stream, so bail to no rollups.
        let tags = match (self.tag_filter_opts.name_and_tags_fn)(id) {
            Ok((_, tags)) => tags,
            Err(err) => {
                warn!(
                    id = %String::from_utf8_lossy(id),
                    error = %err,
                    "failed to extract tags from metric id, skipping rollups"
                );
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            // A target whose tags are not all present in the id is
            // ineligible, not an error; upstream validation keeps rollup
            // tags a subset of the filter tags so this should not occur.
            let tag_pairs = match self.match_target_tags(tags, &target) {
                Some(pairs) => pairs,
                None => continue,
            };
            results.push(RollupResult {
                id: (self.new_rollup_id_fn)(&target.name, &tag_pairs),
                policies_list: vec![StagedPolicies::new(cutover_nanos, false, target.policies)],
            });
        }
        results.sort_by(|a, b| a.id.cmp(&b.id));
        results
    }

    /// Walk the id's sorted tags and the target's ascending tag list in
    /// lock-step, collecting the value of every required tag
    ///
    /// Returns `None` as soon as a required tag is shown to be absent. The
    /// target's tag list being pre-sorted ascending is an upstream
    /// invariant, not enforced here.
    fn match_target_tags(&self, tags: &[u8], target: &RollupTarget) -> Option<Vec<TagPair>> {
        let mut pairs = Vec::with_capacity(target.tags.len());
        let mut iter = (self.tag_filter_opts.sorted_tag_iterator_fn)(tags);
        let mut target_idx = 0;
        let mut has_more = iter.next();
        while has_more && target_idx < target.tags.len() {
            let (tag_name, tag_value) = iter.current();
            match tag_name.cmp(target.tags[target_idx].as_slice()) {
                std::cmp::Ordering::Equal => {
                    pairs.push(TagPair::new(tag_name, tag_value));
                    target_idx += 1;
                    has_more = iter.next();
                }
                // The id's tags sorted past the required name: absent.
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Less => {
                    has_more = iter.next();
                }
            }
        }
        if target_idx == target.tags.len() {
            Some(pairs)
        } else {
            None
        }
    }

    /// Index of the first cutover time strictly after `t`
    fn next_cutover_idx(&self, t: i64) -> usize {
        self.cutover_times_asc.partition_point(|&c| c <= t)
    }

    /// The cutover time at the given index, or the maximum time when the
    /// index is past the timeline
    fn cutover_nanos_at(&self, idx: usize) -> i64 {
        match self.cutover_times_asc.get(idx) {
            Some(&t) => t,
            None => TIME_NANOS_MAX,
        }
    }
}

impl Matcher for ActiveRuleSet {
    fn match_all(&self, id: &[u8], from_nanos: i64, to_nanos: i64, mode: MatchMode) -> MatchResult {
        match mode {
            MatchMode::Forward => self.match_all_forward(id, from_nanos, to_nanos),
            MatchMode::Reverse => self.match_all_reverse(id, from_nanos, to_nanos),
        }
    }
}

impl fmt::Debug for ActiveRuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveRuleSet")
            .field("version", &self.version)
            .field("mapping_rules", &self.mapping_rules)
            .field("rollup_rules", &self.rollup_rules)
            .field("cutover_times_asc", &self.cutover_times_asc)
            .finish_non_exhaustive()
    }
}

/// Append the next mapping stage unless it repeats the last one
///
/// Keeps the list free of consecutive identical policy sets; assumes the
/// existing stages are ascending by cutover time.
pub(crate) fn merge_mapping_results(
    curr_mapping_results: &mut PoliciesList,
    next_mapping_policies: StagedPolicies,
) {
    if let Some(last) = curr_mapping_results.last() {
        if last.same_policies(&next_mapping_policies) {
            return;
        }
    }
    curr_mapping_results.push(next_mapping_policies);
}

/// Merge the rollup results of the next cutover stage into the running
/// results
///
/// Both inputs are ascending by rollup id. Ids present in both merge their
/// policy stages when they differ; ids present only in the current results
/// gained a tombstoned stage at the next cutover; ids present only in the
/// next results are new outputs.
pub(crate) fn merge_rollup_results(
    mut curr_rollup_results: Vec<RollupResult>,
    next_rollup_results: Vec<RollupResult>,
    next_cutover_nanos: i64,
) -> Vec<RollupResult> {
    let num_curr = curr_rollup_results.len();
    let num_next = next_rollup_results.len();
    let mut curr_idx = 0;
    let mut next_idx = 0;

    while curr_idx < num_curr && next_idx < num_next {
        let next_result = &next_rollup_results[next_idx];
        match curr_rollup_results[curr_idx].id.cmp(&next_result.id) {
            // Same id: merge the policy stages when they differ.
            std::cmp::Ordering::Equal => {
                let next_staged = &next_result.policies_list[0];
                let curr_list = &mut curr_rollup_results[curr_idx].policies_list;
                let same = curr_list
                    .last()
                    .map(|last| last.same_policies(next_staged))
                    .unwrap_or(false);
                if !same {
                    curr_list.push(next_staged.clone());
                }
                curr_idx += 1;
                next_idx += 1;
            }
            // Current id is smaller: it was deleted at the next cutover.
            std::cmp::Ordering::Less => {
                append_tombstone(&mut curr_rollup_results[curr_idx], next_cutover_nanos);
                curr_idx += 1;
            }
            // Current id is larger: a new id appeared at the next cutover.
            std::cmp::Ordering::Greater => {
                curr_rollup_results.push(next_result.clone());
                next_idx += 1;
            }
        }
    }

    // Leftover current ids were deleted at the next cutover.
    while curr_idx < num_curr {
        append_tombstone(&mut curr_rollup_results[curr_idx], next_cutover_nanos);
        curr_idx += 1;
    }

    // Leftover next ids are new outputs.
    while next_idx < num_next {
        curr_rollup_results.push(next_rollup_results[next_idx].clone());
        next_idx += 1;
    }

    curr_rollup_results.sort_by(|a, b| a.id.cmp(&b.id));
    curr_rollup_results
}

fn append_tombstone(result: &mut RollupResult, cutover_nanos: i64) {
    let already_tombstoned = result
        .policies_list
        .last()
        .map(|last| last.tombstoned)
        .unwrap_or(false);
    if !already_tombstoned {
        result
            .policies_list
            .push(StagedPolicies::new(cutover_nanos, true, Vec::new()));
    }
}
