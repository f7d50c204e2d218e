//! Index scan operator
//!
//! Runs the index backend in its own task and turns the entries it streams
//! into rows:
//!
//! ```text
//! scan task:  evaluate spans -> ScanRequest -> Index::scan3 -> EntrySender
//! run_once:   IndexConnection -> AnnotatedValue (meta id, covers) -> output
//! ```

use super::base::{OperatorBase, RowSender};
use super::context::{Context, Phase};
use super::pool::{OperatorPool, PoolStats, Recycle};
use super::spans::evaluate_spans;
use super::visitor::Visitor;
use super::Operator;
use crate::algebra::Expression;
use crate::datastore::{
    EntrySender, IndexConnection, IndexEntry, IndexGroupAggregates, IndexKeyOrder,
    IndexProjection, ScanRequest,
};
use crate::error::{Error, Result};
use crate::plan::IndexScanPlan;
use crate::value::{AnnotatedValue, Value};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

lazy_static::lazy_static! {
    static ref INDEX_SCAN_POOL: OperatorPool<IndexScan> = OperatorPool::from_env("index_scan");
}

#[derive(Debug, Default)]
pub struct IndexScan {
    base: OperatorBase,
    plan: Option<Arc<IndexScanPlan>>,
    conn: Option<IndexConnection>,
    pending_docs: u64,
}

/// How entry key components map onto cover names.
struct CoverLayout {
    names: Vec<String>,
    /// `alias.a.b` covers, rebuilt into the alias document.
    paths: Vec<Option<Vec<String>>>,
    filter: Vec<(String, Value)>,
    entry_keys: Option<Vec<usize>>,
    primary_key: bool,
    alias: String,
}

impl CoverLayout {
    fn new(plan: &IndexScanPlan) -> Self {
        Self {
            names: plan.covers.iter().map(Expression::text).collect(),
            paths: plan
                .covers
                .iter()
                .map(|c| c.field_path(&plan.term.alias).filter(|p| !p.is_empty()))
                .collect(),
            filter: plan
                .filter_covers
                .iter()
                .map(|(expr, v)| (expr.text(), v.clone()))
                .collect(),
            entry_keys: plan.projection.as_ref().map(|p| p.entry_keys.clone()),
            primary_key: plan.projection.as_ref().map_or(true, |p| p.primary_key),
            alias: plan.term.alias.clone(),
        }
    }

    fn row(&self, entry: IndexEntry, scope: Option<&AnnotatedValue>, bit: u8) -> Result<AnnotatedValue> {
        let mut av = AnnotatedValue::with_key(&entry.primary_key, scope);
        if !self.names.is_empty() {
            let mut doc = Value::empty_object();
            for (name, v) in &self.filter {
                av.set_cover(name.clone(), v.clone());
            }

            for (i, component) in entry.entry_key.into_iter().enumerate() {
                let pos = match &self.entry_keys {
                    Some(keys) => match keys.get(i) {
                        Some(&pos) => pos,
                        None => continue,
                    },
                    None => i,
                };
                if let Some(Some(path)) = self.paths.get(pos) {
                    set_path(&mut doc, path, component.clone())?;
                }
                if let Some(name) = self.names.get(pos) {
                    av.set_cover(name.clone(), component);
                }
            }

            if self.primary_key {
                if let Some(name) = self.names.last() {
                    av.set_cover(name.clone(), Value::from(entry.primary_key));
                }
            }

            av.set_field(&self.alias, doc)?;
        }
        av.set_bit(bit);
        Ok(av)
    }
}

fn set_path(doc: &mut Value, path: &[String], value: Value) -> Result<()> {
    match path {
        [] => Ok(()),
        [name] => doc.set_field(name, value),
        [name, rest @ ..] => {
            let mut child = match doc.field(name).0 {
                obj @ Value::Object(_) => obj,
                _ => Value::empty_object(),
            };
            set_path(&mut child, rest, value)?;
            doc.set_field(name, child)
        }
    }
}

impl IndexScan {
    pub fn new(plan: Arc<IndexScanPlan>) -> Box<Self> {
        let mut op = INDEX_SCAN_POOL.get();
        op.plan = Some(plan);
        op
    }

    pub fn plan(&self) -> Option<&Arc<IndexScanPlan>> {
        self.plan.as_ref()
    }

    pub fn has_connection(&self) -> bool {
        self.conn.is_some()
    }

    pub fn pool_stats() -> PoolStats {
        INDEX_SCAN_POOL.stats()
    }

    async fn execute(&mut self, ctx: &Arc<Context>, parent: Option<AnnotatedValue>) -> Result<bool> {
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| Error::Internal("index scan without plan".into()))?;

        let (conn, sender) = IndexConnection::new(ctx.config().index_conn_cap);
        self.conn = Some(conn);
        tokio::spawn(scan(plan.clone(), ctx.clone(), sender, parent.clone()));

        // The inner side of a nested-loop join must not leak outer fields.
        let scope = if plan.term.under_nl { None } else { parent };
        let layout = CoverLayout::new(&plan);
        let batch = ctx.config().phase_update_count;
        let stop = self.base.stop_signal();

        loop {
            let Some(conn) = self.conn.as_mut() else {
                break;
            };
            let started = Instant::now();
            let next = tokio::select! {
                next = conn.recv() => next,
                _ = stop.stopped() => {
                    conn.send_stop();
                    self.base.mark_stopped();
                    break;
                }
            };
            self.base.times_mut().add_serv(started.elapsed());

            let entry = match next {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => return Err(err),
                None => break,
            };

            let av = layout.row(entry, scope.as_ref(), self.base.bit())?;
            if !self.base.send_item(av).await {
                break;
            }
            self.pending_docs += 1;
            if self.pending_docs >= batch {
                self.flush_count(ctx);
            }
        }

        Ok(!self.base.is_stopped())
    }

    fn flush_count(&mut self, ctx: &Context) {
        if self.pending_docs > 0 {
            ctx.add_phase_count(Phase::IndexScan, self.pending_docs);
            self.pending_docs = 0;
        }
    }

    /// Stop the backend and drop whatever it buffered.
    fn release(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.send_stop();
            conn.dispose();
        }
    }
}

/// Backend half of the scan, run in its own task. Request failures travel
/// down the connection ahead of the end of stream, so the operator fails
/// with them.
async fn scan(plan: Arc<IndexScanPlan>, ctx: Arc<Context>, conn: EntrySender, parent: Option<AnnotatedValue>) {
    ctx.recover("IndexScan3.scan", async {
        if let Err(err) = scan_request(&plan, &ctx, &conn, parent.as_ref()).await {
            conn.error(err).await;
        }
        Ok(true)
    })
    .await;
    drop(conn);
}

/// Evaluate spans and hand the request to the index.
async fn scan_request(
    plan: &IndexScanPlan,
    ctx: &Context,
    conn: &EntrySender,
    parent: Option<&AnnotatedValue>,
) -> Result<bool> {
    let (spans, empty) = evaluate_spans(
        &plan.spans,
        parent,
        plan.has_dynamic_in_span,
        ctx,
        ctx.config().full_span_fanout,
    )
    .map_err(|e| Error::evaluation(e, "span"))?;

    // An aggregate without GROUP BY still owes one default row.
    let needs_default_row = plan
        .group_aggs
        .as_ref()
        .map_or(false, |g| g.group.is_empty());
    if empty && !needs_default_row {
        debug!(index = %plan.index.name(), "Empty span set, skipping scan");
        return Ok(true);
    }

    let offset = eval_limit_offset(plan.offset.as_ref(), 0, ctx);
    let limit = eval_limit_offset(plan.limit.as_ref(), i64::MAX, ctx);
    let (projection, order, group_aggs) = plan_to_scan_mapping(plan);

    let request = ScanRequest {
        request_id: ctx.request_id().to_string(),
        spans,
        reverse: plan.reverse,
        distinct: plan.distinct,
        projection,
        offset,
        limit,
        group_aggs,
        order,
        consistency: ctx.scan_consistency(),
        vector: ctx.scan_vector(&plan.term.namespace, &plan.term.keyspace),
    };
    plan.index.scan3(request, conn.clone()).await;
    Ok(true)
}

fn eval_limit_offset(expr: Option<&Expression>, default: i64, ctx: &Context) -> i64 {
    let Some(expr) = expr else {
        return default;
    };
    match expr.evaluate(&AnnotatedValue::default(), ctx) {
        Ok(Value::Number(n)) if n.is_finite() => n.trunc() as i64,
        Ok(_) => default,
        Err(err) => {
            ctx.error(err);
            default
        }
    }
}

/// Translate the plan's projection, order and pushdown request into the shape
/// the index expects.
pub fn plan_to_scan_mapping(
    plan: &IndexScanPlan,
) -> (Option<IndexProjection>, Vec<IndexKeyOrder>, Option<IndexGroupAggregates>) {
    let projection = plan.projection.clone();
    let order = plan.order_terms.clone();

    let group_aggs = plan.group_aggs.as_ref().map(|g| {
        // Index keys plus meta().id
        let range_key = plan.index.range_key();
        let index_key_names = (0..=range_key.len())
            .map(|i| match plan.covers.get(i) {
                Some(cover) => cover.text(),
                None if i < range_key.len() => range_key[i].text(),
                None => Expression::MetaId(plan.term.alias.clone()).text(),
            })
            .collect();

        IndexGroupAggregates {
            name: g.name.clone(),
            group: g.group.clone(),
            aggregates: g.aggregates.clone(),
            depends_on_index_keys: g.depends_on_index_keys.clone(),
            index_key_names,
            one_for_primary_key: g.distinct_docid,
            allow_partial_aggr: g.partial,
        }
    });

    (projection, order, group_aggs)
}

impl Recycle for IndexScan {
    fn recycle(&mut self) {
        self.base.recycle();
        self.plan = None;
        self.conn = None;
        self.pending_docs = 0;
    }
}

#[async_trait]
impl Operator for IndexScan {
    fn name(&self) -> &'static str {
        "IndexScan3"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn accept(&self, visitor: &mut dyn Visitor) {
        visitor.visit_index_scan(self);
    }

    fn copy(&self) -> Box<dyn Operator> {
        let mut op = INDEX_SCAN_POOL.get();
        op.plan = self.plan.clone();
        op.base = self.base.copy();
        op
    }

    fn set_output(&mut self, output: RowSender) {
        self.base.set_output(output);
    }

    fn send_stop(&self) {
        self.base.stop_signal().stop();
        if let Some(conn) = &self.conn {
            conn.send_stop();
        }
    }

    fn done(self: Box<Self>) {
        INDEX_SCAN_POOL.put(self);
    }

    #[instrument(skip_all, fields(request_id = %ctx.request_id()))]
    async fn run_once(&mut self, ctx: Arc<Context>, parent: Option<AnnotatedValue>) -> bool {
        if !self.base.begin() {
            return false;
        }

        let ok = ctx.recover(self.name(), self.execute(&ctx, parent)).await;

        self.flush_count(&ctx);
        self.base.finish(&ctx, Phase::IndexScan);
        self.release();
        debug!(ok, "Index scan done");
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::AggregateOp;
    use crate::config::ExecConfig;
    use crate::datastore::{IndexAggregate, MemoryIndex};
    use crate::execution::base::{row_channel, OperatorState};
    use crate::plan::{IndexGroupAggregatesPlan, KeyspaceTerm, PlanRange, PlanSpan};
    use crate::value::Value;
    use serde_json::json;
    use std::collections::HashMap;

    fn index(n: i64) -> Arc<MemoryIndex> {
        Arc::new(
            MemoryIndex::new("idx_v", "bucket", vec![Expression::path("b.v")])
                .with_entries((0..n).map(|i| (vec![Value::from(i)], format!("k{:03}", i)))),
        )
    }

    fn plan(index: Arc<MemoryIndex>, spans: Vec<PlanSpan>) -> IndexScanPlan {
        IndexScanPlan::new(index, KeyspaceTerm::new("bucket", "b"), spans).with_index_covers()
    }

    async fn run(
        plan: IndexScanPlan,
        ctx: Arc<Context>,
        parent: Option<AnnotatedValue>,
    ) -> (bool, Vec<AnnotatedValue>) {
        let mut op = IndexScan::new(Arc::new(plan));
        let (tx, mut rx) = row_channel(ctx.config().pipeline_cap);
        op.set_output(tx);
        let (ok, rows) = tokio::join!(op.run_once(ctx.clone(), parent), async {
            let mut rows = Vec::new();
            while let Some(row) = rx.recv().await {
                rows.push(row);
            }
            rows
        });
        assert_eq!(op.base().state(), OperatorState::Done);
        assert!(!op.has_connection());
        op.done();
        (ok, rows)
    }

    #[tokio::test]
    async fn test_rows_carry_meta_and_covers() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let (ok, rows) = run(plan(index(3), vec![PlanSpan::full()]), ctx, None).await;
        assert!(ok);
        assert_eq!(rows.len(), 3);
        let row = &rows[1];
        assert_eq!(row.meta_id(), Value::from("k001"));
        assert_eq!(row.cover("(`b`.`v`)"), Some(&Value::from(1)));
        assert_eq!(row.cover("(meta(`b`).`id`)"), Some(&Value::from("k001")));
        assert_eq!(row.field("b").0, Value::from(json!({"v": 1})));
        assert_eq!(
            Expression::ident("b").evaluate(row, &HashMap::<String, Value>::new()).unwrap(),
            Value::from(json!({"v": 1}))
        );
    }

    #[tokio::test]
    async fn test_phase_count_is_batched_and_flushed() {
        let config = ExecConfig {
            phase_update_count: 10,
            ..ExecConfig::default()
        };
        let ctx = Arc::new(Context::new(config));
        let (ok, rows) = run(plan(index(25), vec![PlanSpan::full()]), ctx.clone(), None).await;
        assert!(ok);
        assert_eq!(rows.len(), 25);
        assert_eq!(ctx.phase_count(Phase::IndexScan), 25);
    }

    #[tokio::test]
    async fn test_empty_spans_skip_backend() {
        let idx = index(5);
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let backwards = PlanSpan::new(vec![PlanRange::new(
            Some(Expression::constant(4)),
            Some(Expression::constant(1)),
            crate::datastore::Inclusion::Both,
        )]);
        let (ok, rows) = run(plan(idx.clone(), vec![backwards]), ctx, None).await;
        assert!(ok);
        assert!(rows.is_empty());
        assert_eq!(idx.scan_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_spans_with_count_pushdown_emit_default() {
        let idx = index(5);
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let count = IndexGroupAggregatesPlan {
            name: "b".into(),
            aggregates: vec![IndexAggregate {
                operation: AggregateOp::Count,
                entry_key_id: 0,
                key_pos: None,
                expr: None,
                distinct: false,
            }],
            ..Default::default()
        };
        let scan = IndexScanPlan::new(idx.clone(), KeyspaceTerm::new("bucket", "b"), Vec::new())
            .with_group_aggs(count)
            .with_covers(vec![Expression::ident("$count")])
            .with_projection(IndexProjection {
                entry_keys: vec![0],
                primary_key: false,
            });
        let (ok, rows) = run(scan, ctx, None).await;
        assert!(ok);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cover("`$count`"), Some(&Value::from(0)));
        assert_eq!(idx.scan_count(), 1);
    }

    #[tokio::test]
    async fn test_dynamic_in_spans() {
        let ctx = Arc::new(
            Context::new(ExecConfig::default()).with_named_arg("list", Value::from(json!([4, 1, 4]))),
        );
        let span = PlanSpan::new(vec![PlanRange::dynamic_in(Expression::param("list"))]);
        let (ok, rows) = run(plan(index(6), vec![span]), ctx, None).await;
        assert!(ok);
        let keys: Vec<Value> = rows.iter().map(|r| r.meta_id()).collect();
        assert_eq!(keys, vec![Value::from("k001"), Value::from("k004")]);
    }

    #[tokio::test]
    async fn test_offset_and_limit() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let scan = plan(index(10), vec![PlanSpan::full()])
            .with_offset(Expression::constant(2))
            .with_limit(Expression::constant(3));
        let (_, rows) = run(scan, ctx, None).await;
        let keys: Vec<Value> = rows.iter().map(|r| r.meta_id()).collect();
        assert_eq!(keys, vec![Value::from("k002"), Value::from("k003"), Value::from("k004")]);
    }

    #[tokio::test]
    async fn test_under_nl_drops_outer_scope() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let outer = AnnotatedValue::new(Value::from(json!({"o": 1})));

        let (_, rows) = run(plan(index(1), vec![PlanSpan::full()]), ctx.clone(), Some(outer.clone())).await;
        assert_eq!(rows[0].field("o").0, Value::from(1));

        let mut inner = plan(index(1), vec![PlanSpan::full()]);
        inner.term = inner.term.clone().under_nl(true);
        let (_, rows) = run(inner, ctx, Some(outer)).await;
        assert!(rows[0].field("o").0.is_missing());
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported() {
        let idx = index(3);
        idx.fail_with(Some(Error::IndexScan("offline".into())));
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let (ok, rows) = run(plan(idx, vec![PlanSpan::full()]), ctx.clone(), None).await;
        assert!(!ok);
        assert!(rows.is_empty());
        assert_eq!(ctx.errors(), vec![Error::IndexScan("offline".into())]);
    }

    #[tokio::test]
    async fn test_span_error_is_reported() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let span = PlanSpan::new(vec![PlanRange::equal(Expression::param("missing"))]);
        let (ok, rows) = run(plan(index(3), vec![span]), ctx.clone(), None).await;
        assert!(!ok);
        assert!(rows.is_empty());
        let errors = ctx.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], Error::Evaluation { context, .. } if context == "span"));
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let mut op = IndexScan::new(Arc::new(plan(index(3), vec![PlanSpan::full()])));
        op.send_stop();
        assert!(!op.run_once(ctx, None).await);
        assert_eq!(op.base().state(), OperatorState::Stopped);
        op.done();
    }

    #[tokio::test]
    async fn test_stop_while_blocked_on_output() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let mut op = IndexScan::new(Arc::new(plan(index(100), vec![PlanSpan::full()])));
        let (tx, _rx) = row_channel(1);
        op.set_output(tx);
        let stop = op.stop_signal();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stop.stop();
        });
        assert!(!op.run_once(ctx, None).await);
        assert_eq!(op.base().state(), OperatorState::Done);
        assert!(!op.has_connection());
        op.done();
    }

    #[test]
    fn test_copy_shares_plan_only() {
        let scan = IndexScan::new(Arc::new(plan(index(1), vec![PlanSpan::full()])));
        let copy = scan.copy();
        assert_eq!(copy.name(), "IndexScan3");
        scan.send_stop();
        assert!(!copy.base().is_stopped());
        copy.done();
        scan.done();
    }
}
