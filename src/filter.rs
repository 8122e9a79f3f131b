//! Metric id filters
//!
//! Rules select the metric ids they apply to through a [`Filter`]. The real
//! pattern-matching engine is an external collaborator: rule snapshots hold
//! any `Filter` implementation produced by the injected [`NewFilterFn`]
//! factory from a raw `tag -> pattern` map.
//!
//! A reference [`TagsFilter`] is provided for the default options and tests:
//! it requires every filter tag to be present in the id with an equal value,
//! with `*` accepting any value.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::id::{NameAndTagsFn, SortedTagIteratorFn};

/// Raw tag filters as authored: tag name -> value pattern
pub type RawFilters = BTreeMap<String, String>;

/// A predicate over raw metric identifiers
pub trait Filter: std::fmt::Debug + Send + Sync {
    /// Whether the filter matches the given metric id
    fn matches(&self, id: &[u8]) -> bool;
}

/// Compiles raw tag filters into a [`Filter`]
pub type NewFilterFn = Arc<dyn Fn(&RawFilters) -> Result<Arc<dyn Filter>> + Send + Sync>;

/// Id decomposition capabilities shared by filters and the matching core
#[derive(Clone)]
pub struct TagFilterOptions {
    /// Splits a raw id into name and tag bytes
    pub name_and_tags_fn: NameAndTagsFn,
    /// Iterates an id's tags in ascending name order
    pub sorted_tag_iterator_fn: SortedTagIteratorFn,
}

impl TagFilterOptions {
    /// Create options from the two decomposition capabilities
    pub fn new(
        name_and_tags_fn: NameAndTagsFn,
        sorted_tag_iterator_fn: SortedTagIteratorFn,
    ) -> Self {
        Self {
            name_and_tags_fn,
            sorted_tag_iterator_fn,
        }
    }
}

impl std::fmt::Debug for TagFilterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagFilterOptions").finish_non_exhaustive()
    }
}

/// Wildcard pattern accepting any tag value
pub const WILDCARD: &str = "*";

/// Reference conjunctive tag filter
///
/// Matches an id when every filter tag is present with an equal value
/// (`*` accepts any value). Additional id tags are ignored. Tag names are
/// compared in ascending order against the id's sorted tag iterator, so a
/// full match costs one merged pass over both sequences.
#[derive(Debug)]
pub struct TagsFilter {
    filters: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    opts: TagFilterOptions,
}

impl TagsFilter {
    /// Compile raw filters; fails on empty tag names or value patterns
    pub fn new(raw: &RawFilters, opts: TagFilterOptions) -> Result<Self> {
        let mut filters = Vec::with_capacity(raw.len());
        // BTreeMap iteration gives ascending tag names.
        for (name, pattern) in raw {
            if name.is_empty() {
                return Err(Error::InvalidFilter("empty tag name".to_string()));
            }
            if pattern.is_empty() {
                return Err(Error::InvalidFilter(format!(
                    "empty value pattern for tag {}",
                    name
                )));
            }
            let value = if pattern == WILDCARD {
                None
            } else {
                Some(pattern.clone().into_bytes())
            };
            filters.push((name.clone().into_bytes(), value));
        }
        Ok(Self { filters, opts })
    }
}

impl Filter for TagsFilter {
    fn matches(&self, id: &[u8]) -> bool {
        let tags = match (self.opts.name_and_tags_fn)(id) {
            Ok((_, tags)) => tags,
            Err(_) => return false,
        };
        let mut iter = (self.opts.sorted_tag_iterator_fn)(tags);
        let mut filter_idx = 0;
        let mut has_more = iter.next();
        while has_more && filter_idx < self.filters.len() {
            let (tag_name, tag_value) = iter.current();
            let (want_name, want_value) = &self.filters[filter_idx];
            match tag_name.cmp(want_name.as_slice()) {
                std::cmp::Ordering::Equal => {
                    if let Some(want) = want_value {
                        if tag_value != want.as_slice() {
                            return false;
                        }
                    }
                    filter_idx += 1;
                    has_more = iter.next();
                }
                // The id's tags sorted past the required name: absent.
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Less => {
                    has_more = iter.next();
                }
            }
        }
        filter_idx == self.filters.len()
    }
}
