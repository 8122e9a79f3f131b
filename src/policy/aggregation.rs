//! Aggregation function types and compact function sets
//!
//! Policies carry the set of aggregation functions to apply to matched
//! metrics. The set is stored as a bitset ([`AggregationId`]) so that
//! merging and comparing sets during policy resolution is a couple of
//! integer operations rather than a collection walk.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single aggregation function applied to matched metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationType {
    /// Last value in the window
    Last,
    /// Minimum value
    Min,
    /// Maximum value
    Max,
    /// Arithmetic mean
    Mean,
    /// Median value
    Median,
    /// Number of values
    Count,
    /// Sum of values
    Sum,
    /// Sum of squares
    SumSq,
    /// Standard deviation
    Stdev,
    /// 95th percentile
    P95,
    /// 99th percentile
    P99,
}

impl AggregationType {
    /// All supported aggregation types, in bit order
    pub const ALL: [AggregationType; 11] = [
        AggregationType::Last,
        AggregationType::Min,
        AggregationType::Max,
        AggregationType::Mean,
        AggregationType::Median,
        AggregationType::Count,
        AggregationType::Sum,
        AggregationType::SumSq,
        AggregationType::Stdev,
        AggregationType::P95,
        AggregationType::P99,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationType::Last => "last",
            AggregationType::Min => "min",
            AggregationType::Max => "max",
            AggregationType::Mean => "mean",
            AggregationType::Median => "median",
            AggregationType::Count => "count",
            AggregationType::Sum => "sum",
            AggregationType::SumSq => "sumsq",
            AggregationType::Stdev => "stdev",
            AggregationType::P95 => "p95",
            AggregationType::P99 => "p99",
        };
        write!(f, "{}", name)
    }
}

/// A compact set of aggregation functions
///
/// The empty set is the default id and means "apply the pipeline's default
/// aggregations"; it is distinct from explicitly listing functions.
///
/// # Example
///
/// ```rust
/// use kuba_rules::policy::{AggregationId, AggregationType};
///
/// let id = AggregationId::from_types([AggregationType::Min, AggregationType::Max]);
/// assert!(id.contains(AggregationType::Min));
/// assert!(!id.contains(AggregationType::Sum));
/// assert!(!id.is_default());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregationId(u32);

impl AggregationId {
    /// The default id: no explicit functions, use pipeline defaults
    pub const DEFAULT: AggregationId = AggregationId(0);

    /// Build an id from an iterator of aggregation types
    pub fn from_types<I>(types: I) -> Self
    where
        I: IntoIterator<Item = AggregationType>,
    {
        let mut bits = 0;
        for t in types {
            bits |= t.bit();
        }
        AggregationId(bits)
    }

    /// Whether this is the default (empty) id
    pub fn is_default(&self) -> bool {
        self.0 == 0
    }

    /// Whether the set contains the given aggregation type
    pub fn contains(&self, t: AggregationType) -> bool {
        self.0 & t.bit() != 0
    }

    /// Merge another id into this one
    ///
    /// Returns the union and whether the union differs from `self`. Merging
    /// with the default id yields the default only if both are default:
    /// explicit functions always win over "use defaults".
    pub fn merge(&self, other: AggregationId) -> (AggregationId, bool) {
        let merged = AggregationId(self.0 | other.0);
        (merged, merged != *self)
    }

    /// The aggregation types in this set, in bit order
    pub fn types(&self) -> Vec<AggregationType> {
        AggregationType::ALL
            .iter()
            .copied()
            .filter(|t| self.contains(*t))
            .collect()
    }
}

impl fmt::Display for AggregationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            return write!(f, "default");
        }
        let mut first = true;
        for t in self.types() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", t)?;
            first = false;
        }
        Ok(())
    }
}
