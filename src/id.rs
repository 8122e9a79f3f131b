//! Metric id decomposition and rollup id synthesis
//!
//! The matching core never assumes a concrete metric id wire format. Ids are
//! decomposed, iterated, classified, and synthesized through capabilities
//! injected at construction time:
//!
//! - **`NameAndTagsFn`**: split a raw id into its name and tag bytes
//! - **`SortedTagIteratorFn`**: iterate tag name/value pairs in ascending
//!   name order
//! - **`NewRollupIdFn`**: synthesize a derived rollup metric id
//! - **`IsRollupIdFn`**: classify an id as a rollup output
//!
//! This module also ships a reference codec (`name+tag=value,tag=value`,
//! tags ascending by name) that backs the default options and the test
//! suite. Rollup ids synthesized by the reference codec carry the reserved
//! `kuba_rollup=true` tag so they can be classified without extra state.

use std::sync::Arc;

use crate::error::{Error, Result};

/// Separator between the metric name and its tags in the reference codec
pub const NAME_TAG_SEPARATOR: u8 = b'+';
/// Separator between tag pairs in the reference codec
pub const TAG_PAIR_SEPARATOR: u8 = b',';
/// Separator between a tag name and its value in the reference codec
pub const TAG_VALUE_SEPARATOR: u8 = b'=';

/// Reserved tag marking reference-codec rollup ids
pub const ROLLUP_TAG_NAME: &[u8] = b"kuba_rollup";
/// Value of the reserved rollup tag
pub const ROLLUP_TAG_VALUE: &[u8] = b"true";

/// An owned tag name/value pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagPair {
    /// Tag name
    pub name: Vec<u8>,
    /// Tag value
    pub value: Vec<u8>,
}

impl TagPair {
    /// Create a new tag pair
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Iterates tag name/value pairs in ascending name order
///
/// Cursor iteration rather than `Iterator`: `next()` advances and reports
/// whether a pair is available, `current()` borrows the pair at the cursor,
/// so implementations can decode in place without owning the pair.
pub trait TagIterator {
    /// Advance to the next pair, returning false when exhausted
    fn next(&mut self) -> bool;

    /// The pair at the cursor; only valid after `next()` returned true
    fn current(&self) -> (&[u8], &[u8]);
}

/// Splits a raw metric id into its name and tag bytes
pub type NameAndTagsFn =
    Arc<dyn for<'a> Fn(&'a [u8]) -> Result<(&'a [u8], &'a [u8])> + Send + Sync>;

/// Produces a sorted tag iterator over the tag bytes of an id
pub type SortedTagIteratorFn =
    Arc<dyn for<'a> Fn(&'a [u8]) -> Box<dyn TagIterator + 'a> + Send + Sync>;

/// Synthesizes a rollup metric id from a rollup name and tag pairs
pub type NewRollupIdFn = Arc<dyn Fn(&[u8], &[TagPair]) -> Vec<u8> + Send + Sync>;

/// Classifies a decomposed id (name, tags) as a rollup output
pub type IsRollupIdFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Split a reference-codec id into name and tag bytes
///
/// An id without a `+` separator is a bare name with no tags. An empty id
/// is invalid.
pub fn parse_name_and_tags(id: &[u8]) -> Result<(&[u8], &[u8])> {
    if id.is_empty() {
        return Err(Error::InvalidMetricId("empty id".to_string()));
    }
    match id.iter().position(|&b| b == NAME_TAG_SEPARATOR) {
        Some(0) => Err(Error::InvalidMetricId(format!(
            "missing name: {}",
            String::from_utf8_lossy(id)
        ))),
        Some(idx) => Ok((&id[..idx], &id[idx + 1..])),
        None => Ok((id, &[])),
    }
}

/// Sorted tag iterator over reference-codec tag bytes
///
/// Assumes the encoded tags are already in ascending name order, which
/// [`format_id`] guarantees for ids it produced.
pub struct SimpleTagIterator<'a> {
    remaining: &'a [u8],
    current: (&'a [u8], &'a [u8]),
    done: bool,
}

impl<'a> SimpleTagIterator<'a> {
    /// Create an iterator over encoded tag bytes
    pub fn new(tags: &'a [u8]) -> Self {
        Self {
            remaining: tags,
            current: (&[], &[]),
            done: tags.is_empty(),
        }
    }
}

impl<'a> TagIterator for SimpleTagIterator<'a> {
    fn next(&mut self) -> bool {
        if self.done {
            return false;
        }
        let pair = match self
            .remaining
            .iter()
            .position(|&b| b == TAG_PAIR_SEPARATOR)
        {
            Some(idx) => {
                let pair = &self.remaining[..idx];
                self.remaining = &self.remaining[idx + 1..];
                pair
            }
            None => {
                let pair = self.remaining;
                self.remaining = &[];
                self.done = true;
                pair
            }
        };
        match pair.iter().position(|&b| b == TAG_VALUE_SEPARATOR) {
            Some(idx) => {
                self.current = (&pair[..idx], &pair[idx + 1..]);
            }
            None => {
                self.current = (pair, &[]);
            }
        }
        true
    }

    fn current(&self) -> (&[u8], &[u8]) {
        self.current
    }
}

/// Encode a name and tag pairs into a reference-codec id
///
/// Tag pairs are sorted ascending by name before encoding so the result is
/// always iterable by [`SimpleTagIterator`].
pub fn format_id(name: &[u8], tag_pairs: &[TagPair]) -> Vec<u8> {
    let mut pairs: Vec<&TagPair> = tag_pairs.iter().collect();
    pairs.sort_by(|a, b| a.name.cmp(&b.name));

    let mut id = Vec::with_capacity(
        name.len() + pairs.iter().map(|p| p.name.len() + p.value.len() + 2).sum::<usize>(),
    );
    id.extend_from_slice(name);
    for (i, pair) in pairs.iter().enumerate() {
        id.push(if i == 0 {
            NAME_TAG_SEPARATOR
        } else {
            TAG_PAIR_SEPARATOR
        });
        id.extend_from_slice(&pair.name);
        id.push(TAG_VALUE_SEPARATOR);
        id.extend_from_slice(&pair.value);
    }
    id
}

/// Boxed [`SimpleTagIterator`] constructor matching [`SortedTagIteratorFn`]
pub fn simple_sorted_tag_iterator(tags: &[u8]) -> Box<dyn TagIterator + '_> {
    Box::new(SimpleTagIterator::new(tags))
}

/// Synthesize a reference-codec rollup id, adding the reserved rollup tag
pub fn simple_rollup_id(name: &[u8], tag_pairs: &[TagPair]) -> Vec<u8> {
    let mut pairs = tag_pairs.to_vec();
    pairs.push(TagPair::new(ROLLUP_TAG_NAME, ROLLUP_TAG_VALUE));
    format_id(name, &pairs)
}

/// Whether decomposed reference-codec (name, tags) denote a rollup id
pub fn is_simple_rollup_id(_name: &[u8], tags: &[u8]) -> bool {
    let mut iter = SimpleTagIterator::new(tags);
    while iter.next() {
        let (tag_name, tag_value) = iter.current();
        if tag_name == ROLLUP_TAG_NAME {
            return tag_value == ROLLUP_TAG_VALUE;
        }
        // Tags are ascending, bail once past the reserved name.
        if tag_name > ROLLUP_TAG_NAME {
            return false;
        }
    }
    false
}
