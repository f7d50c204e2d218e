//! Parallel fan-out over independent subtrees.
//!
//! Every child runs in its own task and writes straight into the union's
//! output. Interleaving across children is unspecified; each child keeps its
//! own order.

use super::base::{OperatorBase, StopSignal};
use super::context::{Context, Phase};
use super::pool::{OperatorPool, PoolStats, Recycle};
use super::visitor::Visitor;
use super::Operator;
use crate::error::{Error, Result};
use crate::plan::UnionAllPlan;
use crate::value::AnnotatedValue;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

lazy_static::lazy_static! {
    static ref UNION_ALL_POOL: OperatorPool<UnionAll> = OperatorPool::from_env("union_all");
    static ref CHILDREN_POOL: OperatorPool<OperatorList> = OperatorPool::from_env("union_children");
}

/// Recyclable child vector.
#[derive(Debug, Default)]
pub struct OperatorList(pub Vec<Box<dyn Operator>>);

impl Recycle for OperatorList {
    fn recycle(&mut self) {
        self.0.clear();
    }
}

#[derive(Debug, Default)]
pub struct UnionAll {
    base: OperatorBase,
    plan: Option<Arc<UnionAllPlan>>,
    children: Option<Box<OperatorList>>,
}

impl UnionAll {
    pub fn new(plan: Arc<UnionAllPlan>, children: Vec<Box<dyn Operator>>) -> Box<Self> {
        let mut op = UNION_ALL_POOL.get();
        let mut list = CHILDREN_POOL.get();
        list.0.extend(children);
        op.plan = Some(plan);
        op.children = Some(list);
        op
    }

    pub fn plan(&self) -> Option<&Arc<UnionAllPlan>> {
        self.plan.as_ref()
    }

    pub fn children(&self) -> &[Box<dyn Operator>] {
        match &self.children {
            Some(list) => list.0.as_slice(),
            None => &[],
        }
    }

    pub fn pool_stats() -> PoolStats {
        UNION_ALL_POOL.stats()
    }

    async fn execute(&mut self, ctx: &Arc<Context>, parent: Option<AnnotatedValue>) -> Result<bool> {
        let children: Vec<Box<dyn Operator>> = match self.children.as_mut() {
            Some(list) => list.0.drain(..).collect(),
            None => Vec::new(),
        };
        if !ctx.assert(!children.is_empty(), "UnionAll has no children") {
            return Ok(false);
        }

        let count = children.len();
        let output = self.base.output().cloned();
        let mut stops: Vec<StopSignal> = Vec::with_capacity(count);
        let mut tasks = JoinSet::new();

        for (idx, mut child) in children.into_iter().enumerate() {
            if let Some(output) = &output {
                child.set_output(output.clone());
            }
            stops.push(child.stop_signal());
            let ctx = ctx.clone();
            let parent = parent.clone();
            tasks.spawn(async move {
                let ok = child.run_once(ctx, parent).await;
                (idx, child, ok)
            });
        }
        // Children hold their own clones now.
        drop(output);

        let own_stop = self.base.stop_signal();
        let mut returned: Vec<Option<Box<dyn Operator>>> = (0..count).map(|_| None).collect();
        let mut ok = true;
        let mut lost = 0usize;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((idx, child, child_ok))) => {
                        returned[idx] = Some(child);
                        if !child_ok && ok {
                            debug!(child = idx, "Union branch failed, stopping siblings");
                            ok = false;
                            stops.iter().for_each(StopSignal::stop);
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "Union branch task lost");
                        lost += 1;
                        ok = false;
                        stops.iter().for_each(StopSignal::stop);
                    }
                    None => break,
                },
                _ = own_stop.stopped(), if ok => {
                    ok = false;
                    self.base.mark_stopped();
                    stops.iter().for_each(StopSignal::stop);
                }
            }
        }

        if let Some(list) = self.children.as_mut() {
            list.0.extend(returned.into_iter().flatten());
        }
        ctx.set_sort_count(0);

        if lost > 0 {
            return Err(Error::Execution(format!("{} union branches did not complete", lost)));
        }
        if !ok && !self.base.is_stopped() && !ctx.has_errors() {
            return Err(Error::Execution("union branch failed".into()));
        }
        Ok(ok)
    }
}

impl Recycle for UnionAll {
    fn recycle(&mut self) {
        self.base.recycle();
        self.plan = None;
        if let Some(list) = self.children.take() {
            CHILDREN_POOL.put(list);
        }
    }
}

#[async_trait]
impl Operator for UnionAll {
    fn name(&self) -> &'static str {
        "UnionAll"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn accept(&self, visitor: &mut dyn Visitor) {
        visitor.visit_union_all(self);
    }

    fn copy(&self) -> Box<dyn Operator> {
        let mut op = UNION_ALL_POOL.get();
        let mut list = CHILDREN_POOL.get();
        list.0.extend(self.children().iter().map(|c| c.copy()));
        op.plan = self.plan.clone();
        op.base = self.base.copy();
        op.children = Some(list);
        op
    }

    fn done(mut self: Box<Self>) {
        if let Some(list) = self.children.as_mut() {
            for child in list.0.drain(..) {
                child.done();
            }
        }
        UNION_ALL_POOL.put(self);
    }

    #[instrument(skip_all, fields(request_id = %ctx.request_id()))]
    async fn run_once(&mut self, ctx: Arc<Context>, parent: Option<AnnotatedValue>) -> bool {
        if !self.base.begin() {
            return false;
        }

        let ok = ctx.recover(self.name(), self.execute(&ctx, parent)).await;

        self.base.finish(&ctx, Phase::UnionAll);
        debug!(ok, children = self.children().len(), "Union done");
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecConfig;
    use crate::execution::base::{row_channel, OperatorState};
    use crate::execution::scan_index::IndexScan;
    use crate::algebra::Expression;
    use crate::datastore::MemoryIndex;
    use crate::plan::{IndexScanPlan, KeyspaceTerm, PlanSpan};
    use crate::value::Value;

    fn scan(n: i64) -> (Arc<MemoryIndex>, Box<dyn Operator>) {
        let index = Arc::new(
            MemoryIndex::new("idx", "bucket", vec![Expression::path("b.v")])
                .with_entries((0..n).map(|i| (vec![Value::from(i)], format!("k{}", i)))),
        );
        let plan = IndexScanPlan::new(index.clone(), KeyspaceTerm::new("bucket", "b"), vec![PlanSpan::full()])
            .with_index_covers();
        (index, IndexScan::new(Arc::new(plan)))
    }

    fn union(children: Vec<Box<dyn Operator>>) -> Box<UnionAll> {
        UnionAll::new(Arc::new(UnionAllPlan::new(Vec::new())), children)
    }

    #[tokio::test]
    async fn test_merges_all_branches() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        ctx.set_sort_count(7);
        let (_, a) = scan(10);
        let (_, b) = scan(5);
        let mut op = union(vec![a, b]);
        let (tx, mut rx) = row_channel(8);
        op.set_output(tx);

        let (ok, count) = tokio::join!(op.run_once(ctx.clone(), None), async {
            let mut n = 0;
            while rx.recv().await.is_some() {
                n += 1;
            }
            n
        });
        assert!(ok);
        assert_eq!(count, 15);
        assert_eq!(ctx.sort_count(), 0);
        assert_eq!(op.children().len(), 2);
        assert!(op.children().iter().all(|c| c.base().state() == OperatorState::Done));
        op.done();
    }

    #[tokio::test]
    async fn test_no_children_is_an_assertion() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let mut op = union(Vec::new());
        assert!(!op.run_once(ctx.clone(), None).await);
        assert_eq!(ctx.errors(), vec![Error::Assertion("UnionAll has no children".into())]);
        op.done();
    }

    #[tokio::test]
    async fn test_failed_branch_stops_siblings() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let (failing_index, failing) = scan(3);
        failing_index.fail_with(Some(Error::IndexScan("offline".into())));
        let (_, slow) = scan(10_000);
        let mut op = union(vec![slow, failing]);
        // Nobody reads: the healthy branch blocks on the full channel.
        let (tx, _rx) = row_channel(1);
        op.set_output(tx);

        let ok = tokio::time::timeout(std::time::Duration::from_secs(5), op.run_once(ctx.clone(), None))
            .await
            .expect("union did not stop its branches");
        assert!(!ok);
        assert!(ctx.errors().contains(&Error::IndexScan("offline".into())));
        assert_eq!(op.children().len(), 2);
        assert!(op.children().iter().all(|c| c.base().state() == OperatorState::Done));
        op.done();
    }

    #[tokio::test]
    async fn test_stop_propagates_to_children() {
        let ctx = Arc::new(Context::new(ExecConfig::default()));
        let (_, a) = scan(10_000);
        let (_, b) = scan(10_000);
        let mut op = union(vec![a, b]);
        let (tx, _rx) = row_channel(1);
        op.set_output(tx);
        let stop = op.stop_signal();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stop.stop();
        });

        let ok = tokio::time::timeout(std::time::Duration::from_secs(5), op.run_once(ctx.clone(), None))
            .await
            .expect("stop was not propagated");
        assert!(!ok);
        assert!(!ctx.has_errors());
        assert!(op.children().iter().all(|c| c.base().state() == OperatorState::Done));
        op.done();
    }

    #[test]
    fn test_copy_is_independent() {
        let (_, a) = scan(1);
        let op = union(vec![a]);
        let copy = op.copy();
        op.send_stop();
        assert!(!copy.base().is_stopped());
        copy.done();
        op.done();
    }
}
