//! In-memory index for testing and the CLI
//!
//! Keeps every entry in key order and answers scans, including
//! group/aggregate pushdown, by filtering a snapshot of that list.

use super::{
    EntrySender, Index, IndexEntry, IndexGroupAggregates, IndexKeyOrder, IndexProjection,
    ScanRequest,
};
use crate::algebra::{new_aggregate, Aggregate, AggregateId, AggregateOp, Expression};
use crate::error::{Error, Result};
use crate::value::{AnnotatedValue, Value};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, instrument};

/// In-memory ordered index
#[derive(Debug)]
pub struct MemoryIndex {
    id: String,
    name: String,
    keyspace: String,
    range_key: Vec<Expression>,
    entries: RwLock<Vec<IndexEntry>>,
    fail_with: RwLock<Option<Error>>,
    scans: AtomicUsize,
}

impl MemoryIndex {
    /// Create an empty index over `range_key` for `keyspace`.
    pub fn new(name: impl Into<String>, keyspace: impl Into<String>, range_key: Vec<Expression>) -> Self {
        let name = name.into();
        Self {
            id: format!("mem:{}", name),
            name,
            keyspace: keyspace.into(),
            range_key,
            entries: RwLock::new(Vec::new()),
            fail_with: RwLock::new(None),
            scans: AtomicUsize::new(0),
        }
    }

    /// Add an entry, keeping the index sorted by key then primary key.
    pub fn insert(&self, entry_key: Vec<Value>, primary_key: impl Into<String>) {
        let entry = IndexEntry::new(entry_key, primary_key);
        let mut entries = self.entries.write();
        let pos = entries
            .binary_search_by(|e| compare_entries(e, &entry))
            .unwrap_or_else(|pos| pos);
        entries.insert(pos, entry);
    }

    /// Builder-style bulk insert.
    pub fn with_entries(self, entries: impl IntoIterator<Item = (Vec<Value>, String)>) -> Self {
        for (key, pk) in entries {
            self.insert(key, pk);
        }
        self
    }

    /// Make every following scan report `err` instead of returning entries.
    pub fn fail_with(&self, err: Option<Error>) {
        *self.fail_with.write() = err;
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of scans started against this index.
    pub fn scan_count(&self) -> usize {
        self.scans.load(AtomicOrdering::Relaxed)
    }

    /// Entries satisfying the request, in delivery order.
    fn select(&self, request: &ScanRequest) -> Result<Vec<IndexEntry>> {
        if let Some(err) = self.fail_with.read().clone() {
            return Err(err);
        }

        let mut matched: Vec<IndexEntry> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|e| {
                    request
                        .spans
                        .iter()
                        .any(|span| !span.is_empty() && span.matches(&e.entry_key))
                })
                .cloned()
                .collect()
        };

        if !request.order.is_empty() {
            sort_by_order(&mut matched, &request.order);
        }
        if request.reverse {
            matched.reverse();
        }

        let rows = match &request.group_aggs {
            Some(group_aggs) => self.aggregate(&matched, group_aggs, request.projection.as_ref())?,
            None => matched
                .into_iter()
                .map(|e| self.project(e, request.projection.as_ref()))
                .collect(),
        };

        let rows = if request.distinct {
            let mut seen = BTreeSet::new();
            rows.into_iter()
                .filter(|e| seen.insert(e.entry_key.clone()))
                .collect()
        } else {
            rows
        };

        let offset = request.offset.max(0) as usize;
        let limit = request.limit.max(0);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    fn key_component(&self, entry: &IndexEntry, pos: usize) -> Value {
        if pos == self.range_key.len() {
            Value::from(entry.primary_key.as_str())
        } else {
            entry.entry_key.get(pos).cloned().unwrap_or(Value::Missing)
        }
    }

    fn project(&self, entry: IndexEntry, projection: Option<&IndexProjection>) -> IndexEntry {
        match projection {
            Some(proj) => {
                let entry_key = proj
                    .entry_keys
                    .iter()
                    .filter(|&&pos| pos < self.range_key.len())
                    .map(|&pos| self.key_component(&entry, pos))
                    .collect();
                IndexEntry::new(entry_key, entry.primary_key)
            }
            None => entry,
        }
    }

    /// Group and aggregate entries the way a covering GROUP BY would, emitting
    /// one partial-aggregate entry per group.
    fn aggregate(
        &self,
        entries: &[IndexEntry],
        pushdown: &IndexGroupAggregates,
        projection: Option<&IndexProjection>,
    ) -> Result<Vec<IndexEntry>> {
        let functions: Vec<Arc<dyn Aggregate>> = pushdown
            .aggregates
            .iter()
            .enumerate()
            .map(|(i, a)| new_aggregate(a.operation, None, AggregateId(i as u32)))
            .collect();
        let args: HashMap<String, Value> = HashMap::new();
        let mut groups: BTreeMap<Vec<Value>, GroupState> = BTreeMap::new();

        for entry in entries {
            let row = self.cover_row(entry, pushdown);

            let mut key = Vec::with_capacity(pushdown.group.len());
            for g in &pushdown.group {
                key.push(self.operand(entry, &row, g.key_pos, g.expr.as_ref(), &args)?);
            }

            let state = groups
                .entry(key)
                .or_insert_with(|| GroupState::new(&functions));
            if pushdown.one_for_primary_key && !state.primary_keys.insert(entry.primary_key.clone()) {
                continue;
            }

            for (i, agg) in pushdown.aggregates.iter().enumerate() {
                let operand = self.operand(entry, &row, agg.key_pos, agg.expr.as_ref(), &args)?;
                if operand.is_unknown() {
                    continue;
                }
                if agg.distinct && !state.distinct[i].insert(operand.clone()) {
                    continue;
                }
                let part = match agg.operation {
                    AggregateOp::Count => Value::from(1),
                    _ => operand,
                };
                let cumulative = std::mem::replace(&mut state.accumulators[i], Value::Null);
                state.accumulators[i] = functions[i].cumulate_intermediate(part, cumulative)?;
            }
        }

        if groups.is_empty() && pushdown.group.is_empty() {
            groups.insert(Vec::new(), GroupState::new(&functions));
        }

        let rows = groups
            .into_iter()
            .map(|(key, state)| {
                let mut by_id: BTreeMap<usize, Value> = BTreeMap::new();
                for (g, v) in pushdown.group.iter().zip(key) {
                    by_id.insert(g.entry_key_id, v);
                }
                for (a, v) in pushdown.aggregates.iter().zip(state.accumulators) {
                    by_id.insert(a.entry_key_id, v);
                }
                let entry_key = match projection {
                    Some(proj) => proj
                        .entry_keys
                        .iter()
                        .map(|id| by_id.get(id).cloned().unwrap_or(Value::Missing))
                        .collect(),
                    None => by_id.into_values().collect(),
                };
                IndexEntry::new(entry_key, "")
            })
            .collect();
        Ok(rows)
    }

    /// Row whose covers hold every index key and the primary key under the
    /// names the plan uses for them.
    fn cover_row(&self, entry: &IndexEntry, pushdown: &IndexGroupAggregates) -> AnnotatedValue {
        let mut row = AnnotatedValue::with_key(&entry.primary_key, None);
        for (pos, name) in pushdown.index_key_names.iter().enumerate() {
            row.set_cover(name.clone(), self.key_component(entry, pos));
        }
        row
    }

    fn operand(
        &self,
        entry: &IndexEntry,
        row: &AnnotatedValue,
        key_pos: Option<usize>,
        expr: Option<&Expression>,
        args: &HashMap<String, Value>,
    ) -> Result<Value> {
        match (key_pos, expr) {
            (Some(pos), _) => Ok(self.key_component(entry, pos)),
            (None, Some(expr)) => expr.evaluate(row, args),
            (None, None) => Ok(Value::TRUE),
        }
    }
}

struct GroupState {
    accumulators: Vec<Value>,
    distinct: Vec<BTreeSet<Value>>,
    primary_keys: HashSet<String>,
}

impl GroupState {
    fn new(functions: &[Arc<dyn Aggregate>]) -> Self {
        Self {
            accumulators: functions.iter().map(|f| f.default_value()).collect(),
            distinct: vec![BTreeSet::new(); functions.len()],
            primary_keys: HashSet::new(),
        }
    }
}

fn compare_entries(a: &IndexEntry, b: &IndexEntry) -> Ordering {
    a.entry_key
        .cmp(&b.entry_key)
        .then_with(|| a.primary_key.cmp(&b.primary_key))
}

fn sort_by_order(entries: &mut [IndexEntry], order: &[IndexKeyOrder]) {
    entries.sort_by(|a, b| {
        for term in order {
            let x = a.entry_key.get(term.key_pos).unwrap_or(&Value::Missing);
            let y = b.entry_key.get(term.key_pos).unwrap_or(&Value::Missing);
            let cmp = if term.desc { y.collate(x) } else { x.collate(y) };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    });
}

#[async_trait]
impl Index for MemoryIndex {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn keyspace(&self) -> &str {
        &self.keyspace
    }

    fn range_key(&self) -> &[Expression] {
        &self.range_key
    }

    #[instrument(skip(self, request, conn), fields(index = %self.name, request_id = %request.request_id))]
    async fn scan3(&self, request: ScanRequest, conn: EntrySender) {
        self.scans.fetch_add(1, AtomicOrdering::Relaxed);

        let rows = match self.select(&request) {
            Ok(rows) => rows,
            Err(err) => {
                debug!(error = %err, "Index scan failed");
                conn.error(err).await;
                return;
            }
        };

        let total = rows.len();
        let mut sent = 0usize;
        for row in rows {
            if !conn.send(row).await {
                break;
            }
            sent += 1;
        }
        debug!(sent, total, "Index scan finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{
        IndexAggregate, IndexConnection, IndexGroupKey, Inclusion, ScanRange, ScanSpan,
    };

    fn index() -> MemoryIndex {
        MemoryIndex::new("idx_v", "b", vec![Expression::path("b.v")]).with_entries(
            [Value::Null, Value::from(3), Value::Missing, Value::from(7), Value::from(2)]
                .into_iter()
                .enumerate()
                .map(|(i, v)| (vec![v], format!("k{}", i))),
        )
    }

    fn full_span() -> ScanSpan {
        ScanSpan::new(vec![ScanRange::default()])
    }

    async fn run(index: &MemoryIndex, request: ScanRequest) -> Vec<IndexEntry> {
        let (mut conn, sender) = IndexConnection::new(16);
        index.scan3(request, sender).await;
        let mut out = Vec::new();
        while let Some(entry) = conn.recv().await {
            out.push(entry.unwrap());
        }
        out
    }

    fn max_pushdown(group: Vec<IndexGroupKey>) -> IndexGroupAggregates {
        IndexGroupAggregates {
            name: "b".into(),
            group,
            aggregates: vec![IndexAggregate {
                operation: AggregateOp::Max,
                entry_key_id: 0,
                key_pos: Some(0),
                expr: None,
                distinct: false,
            }],
            index_key_names: vec!["(`b`.`v`)".into(), "(meta(`b`).`id`)".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_entries_are_key_ordered() {
        let out = run(&index(), ScanRequest::new("r", vec![full_span()])).await;
        let keys: Vec<Value> = out.into_iter().map(|e| e.entry_key[0].clone()).collect();
        assert_eq!(
            keys,
            vec![Value::Missing, Value::Null, Value::from(2), Value::from(3), Value::from(7)]
        );
    }

    #[tokio::test]
    async fn test_span_reverse_offset_limit() {
        let span = ScanSpan::new(vec![ScanRange {
            low: Some(Value::from(2)),
            high: None,
            inclusion: Inclusion::Low,
        }]);
        let mut request = ScanRequest::new("r", vec![span]);
        request.reverse = true;
        request.offset = 1;
        request.limit = 1;
        let out = run(&index(), request).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry_key, vec![Value::from(3)]);
        assert_eq!(out[0].primary_key, "k1");
    }

    #[tokio::test]
    async fn test_max_pushdown() {
        let mut request = ScanRequest::new("r", vec![full_span()]);
        request.group_aggs = Some(max_pushdown(Vec::new()));
        let out = run(&index(), request).await;
        assert_eq!(out, vec![IndexEntry::new(vec![Value::from(7)], "")]);
    }

    #[tokio::test]
    async fn test_empty_input_emits_default_row() {
        let mut pushdown = max_pushdown(Vec::new());
        pushdown.aggregates[0].operation = AggregateOp::Count;
        let mut request = ScanRequest::new("r", Vec::new());
        request.group_aggs = Some(pushdown);
        let out = run(&index(), request).await;
        assert_eq!(out, vec![IndexEntry::new(vec![Value::from(0)], "")]);
    }

    #[tokio::test]
    async fn test_grouped_empty_input_emits_nothing() {
        let mut pushdown = max_pushdown(vec![IndexGroupKey {
            entry_key_id: 1,
            key_pos: Some(0),
            expr: None,
        }]);
        pushdown.aggregates[0].operation = AggregateOp::Count;
        let mut request = ScanRequest::new("r", Vec::new());
        request.group_aggs = Some(pushdown);
        assert!(run(&index(), request).await.is_empty());
    }

    #[tokio::test]
    async fn test_group_by_expression_over_covers() {
        let idx = MemoryIndex::new("idx_cv", "b", vec![Expression::path("b.c"), Expression::path("b.v")])
            .with_entries(vec![
                (vec![Value::from("x"), Value::from(1)], "a".to_string()),
                (vec![Value::from("x"), Value::from(1)], "b".to_string()),
                (vec![Value::from("y"), Value::from(5)], "c".to_string()),
            ]);
        let pushdown = IndexGroupAggregates {
            name: "b".into(),
            group: vec![IndexGroupKey {
                entry_key_id: 0,
                key_pos: None,
                expr: Some(Expression::path("b.c")),
            }],
            aggregates: vec![IndexAggregate {
                operation: AggregateOp::Sum,
                entry_key_id: 1,
                key_pos: Some(1),
                expr: None,
                distinct: true,
            }],
            index_key_names: vec![
                "(`b`.`c`)".into(),
                "(`b`.`v`)".into(),
                "(meta(`b`).`id`)".into(),
            ],
            ..Default::default()
        };
        let mut request = ScanRequest::new("r", vec![ScanSpan::new(vec![ScanRange::default()])]);
        request.group_aggs = Some(pushdown);
        let out = run(&idx, request).await;
        assert_eq!(
            out,
            vec![
                IndexEntry::new(vec![Value::from("x"), Value::from(1)], ""),
                IndexEntry::new(vec![Value::from("y"), Value::from(5)], ""),
            ]
        );
    }

    #[tokio::test]
    async fn test_projection_and_distinct() {
        let idx = MemoryIndex::new("idx_cv", "b", vec![Expression::path("b.c"), Expression::path("b.v")])
            .with_entries(vec![
                (vec![Value::from("x"), Value::from(1)], "a".to_string()),
                (vec![Value::from("x"), Value::from(2)], "b".to_string()),
            ]);
        let mut request = ScanRequest::new("r", vec![full_span()]);
        request.projection = Some(IndexProjection {
            entry_keys: vec![0],
            primary_key: false,
        });
        request.distinct = true;
        let out = run(&idx, request).await;
        assert_eq!(out, vec![IndexEntry::new(vec![Value::from("x")], "a")]);
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let idx = index();
        idx.fail_with(Some(Error::IndexScan("offline".into())));
        let (mut conn, sender) = IndexConnection::new(4);
        idx.scan3(ScanRequest::new("r", vec![full_span()]), sender).await;
        assert_eq!(conn.recv().await, Some(Err(Error::IndexScan("offline".into()))));
        assert_eq!(idx.scan_count(), 1);
    }
}
