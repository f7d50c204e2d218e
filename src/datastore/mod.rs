//! Index backend contract
//!
//! # Architecture
//!
//! Leaf scan operators drive an index through the [`Index`] trait. The
//! operator and the backend run as separate tasks connected by an
//! [`IndexConnection`]:
//!
//! ```text
//! IndexScan row pump  <── IndexConnection (bounded) <── Index::scan3 task
//!        │                        │
//!        └──── send_stop() ───────┘ (backend stops producing)
//! ```
//!
//! A scan request carries evaluated spans, projection, ordering,
//! offset/limit and an optional group/aggregate pushdown. The backend
//! streams [`IndexEntry`] values until it runs out, the consumer stops, or
//! it fails (reported through [`EntrySender::error`]).
//!
//! ## Implementations
//!
//! - [`MemoryIndex`]: in-memory ordered index used by tests and the CLI.

pub mod connection;
pub mod memory;

pub use connection::{EntrySender, IndexConnection};
pub use memory::MemoryIndex;

use crate::algebra::{AggregateOp, Expression};
use crate::value::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// One entry streamed back by an index scan.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Returned key components, in projection order.
    pub entry_key: Vec<Value>,
    pub primary_key: String,
}

impl IndexEntry {
    pub fn new(entry_key: Vec<Value>, primary_key: impl Into<String>) -> Self {
        Self {
            entry_key,
            primary_key: primary_key.into(),
        }
    }
}

/// Which bounds of a range are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Inclusion {
    #[default]
    Neither,
    Low,
    High,
    Both,
}

impl Inclusion {
    pub fn low(self) -> bool {
        matches!(self, Inclusion::Low | Inclusion::Both)
    }

    pub fn high(self) -> bool {
        matches!(self, Inclusion::High | Inclusion::Both)
    }
}

/// Evaluated bounds on one index key. `None` is unbounded.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanRange {
    pub low: Option<Value>,
    pub high: Option<Value>,
    pub inclusion: Inclusion,
}

impl ScanRange {
    pub fn equal(value: Value) -> Self {
        Self {
            low: Some(value.clone()),
            high: Some(value),
            inclusion: Inclusion::Both,
        }
    }

    pub fn is_empty(&self) -> bool {
        match (&self.low, &self.high) {
            (Some(low), Some(high)) => match low.collate(high) {
                Ordering::Greater => true,
                Ordering::Equal => self.inclusion != Inclusion::Both,
                Ordering::Less => false,
            },
            _ => false,
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        if let Some(low) = &self.low {
            match key.collate(low) {
                Ordering::Less => return false,
                Ordering::Equal if !self.inclusion.low() => return false,
                _ => {}
            }
        }
        if let Some(high) = &self.high {
            match key.collate(high) {
                Ordering::Greater => return false,
                Ordering::Equal if !self.inclusion.high() => return false,
                _ => {}
            }
        }
        true
    }
}

/// Composite span: range `i` constrains index key `i`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanSpan {
    pub ranges: Vec<ScanRange>,
}

impl ScanSpan {
    pub fn new(ranges: Vec<ScanRange>) -> Self {
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.iter().any(ScanRange::is_empty)
    }

    pub fn matches(&self, key: &[Value]) -> bool {
        self.ranges.iter().enumerate().all(|(i, range)| {
            let component = key.get(i).cloned().unwrap_or(Value::Missing);
            range.contains(&component)
        })
    }
}

/// Index key positions returned by the scan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexProjection {
    pub entry_keys: Vec<usize>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKeyOrder {
    pub key_pos: usize,
    pub desc: bool,
}

#[derive(Debug, Clone)]
pub struct IndexGroupKey {
    pub entry_key_id: usize,
    /// Index key position; `range_key().len()` addresses the primary key.
    pub key_pos: Option<usize>,
    pub expr: Option<Expression>,
}

#[derive(Debug, Clone)]
pub struct IndexAggregate {
    pub operation: AggregateOp,
    pub entry_key_id: usize,
    pub key_pos: Option<usize>,
    pub expr: Option<Expression>,
    pub distinct: bool,
}

/// Grouping and aggregation pushed down into the index.
#[derive(Debug, Clone, Default)]
pub struct IndexGroupAggregates {
    pub name: String,
    pub group: Vec<IndexGroupKey>,
    pub aggregates: Vec<IndexAggregate>,
    pub depends_on_index_keys: Vec<usize>,
    /// Cover names of every index key followed by the primary key.
    pub index_key_names: Vec<String>,
    pub one_for_primary_key: bool,
    pub allow_partial_aggr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanConsistency {
    #[default]
    NotBounded,
    AtPlus,
    RequestPlus,
}

/// Sequence numbers a consistent scan must wait for.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanVector {
    pub entries: Vec<(u32, u64)>,
}

pub trait ScanVectorSource: Send + Sync + fmt::Debug {
    fn scan_vector(&self, namespace: &str, keyspace: &str) -> Option<ScanVector>;
}

/// Everything a backend needs to run one scan.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub request_id: String,
    pub spans: Vec<ScanSpan>,
    pub reverse: bool,
    pub distinct: bool,
    pub projection: Option<IndexProjection>,
    pub offset: i64,
    pub limit: i64,
    pub group_aggs: Option<IndexGroupAggregates>,
    pub order: Vec<IndexKeyOrder>,
    pub consistency: ScanConsistency,
    pub vector: Option<ScanVector>,
}

impl ScanRequest {
    pub fn new(request_id: impl Into<String>, spans: Vec<ScanSpan>) -> Self {
        Self {
            request_id: request_id.into(),
            spans,
            reverse: false,
            distinct: false,
            projection: None,
            offset: 0,
            limit: i64::MAX,
            group_aggs: None,
            order: Vec::new(),
            consistency: ScanConsistency::default(),
            vector: None,
        }
    }
}

/// Index backend trait
#[async_trait]
pub trait Index: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn keyspace(&self) -> &str;

    /// Index key expressions, in key order.
    fn range_key(&self) -> &[Expression];

    /// Stream matching entries into `conn`. Failures are reported through
    /// the connection, never returned.
    async fn scan3(&self, request: ScanRequest, conn: EntrySender);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ranges() {
        assert!(ScanRange {
            low: Some(Value::from(3)),
            high: Some(Value::from(1)),
            inclusion: Inclusion::Both
        }
        .is_empty());
        assert!(ScanRange {
            low: Some(Value::from(1)),
            high: Some(Value::from(1)),
            inclusion: Inclusion::Low
        }
        .is_empty());
        assert!(!ScanRange::equal(Value::from(1)).is_empty());
        assert!(!ScanRange::default().is_empty());
    }

    #[test]
    fn test_span_matches_prefix() {
        let span = ScanSpan::new(vec![
            ScanRange::equal(Value::from("a")),
            ScanRange {
                low: Some(Value::from(10)),
                high: None,
                inclusion: Inclusion::Neither,
            },
        ]);
        assert!(span.matches(&[Value::from("a"), Value::from(11)]));
        assert!(!span.matches(&[Value::from("a"), Value::from(10)]));
        assert!(!span.matches(&[Value::from("b"), Value::from(11)]));
        assert!(!span.matches(&[Value::from("a")]));
    }

    #[test]
    fn test_successor_turns_inclusive_into_exclusive() {
        let inclusive = ScanRange {
            low: Some(Value::from("abc")),
            high: Some(Value::from("abc")),
            inclusion: Inclusion::Both,
        };
        let exclusive = ScanRange {
            low: Some(Value::from("abc")),
            high: Some(Value::from("abc").successor()),
            inclusion: Inclusion::Low,
        };
        for key in ["abb", "abc", "abc ", "abd"] {
            let key = Value::from(key);
            assert_eq!(inclusive.contains(&key), exclusive.contains(&key), "{}", key);
        }
    }
}
