//! Streaming operators
//!
//! Every operator runs once, reads from its children (or an index), and
//! writes rows into the pipeline its parent handed it. A plan runs as a tree
//! of operators connected by bounded channels:
//!
//! ```text
//! Collector <- FinalGroup <- UnionAll <- IndexScan3 (task) <- Index::scan3 (task)
//!                                     <- IndexScan3 (task) <- Index::scan3 (task)
//! ```
//!
//! Operators are pooled. Build them with [`build_operator`] and hand them
//! back with [`Operator::done`] once the run is over.

pub mod base;
pub mod collect;
pub mod context;
pub mod group;
pub mod pool;
pub mod scan_index;
pub mod spans;
pub mod union;
pub mod visitor;

pub use base::{row_channel, OperatorBase, OperatorState, RowReceiver, RowSender, StopSignal};
pub use collect::Collector;
pub use context::{Context, Phase};
pub use group::Group;
pub use pool::{OperatorPool, PoolStats, Recycle};
pub use scan_index::IndexScan;
pub use union::UnionAll;
pub use visitor::{ProfileVisitor, Visitor};

use crate::error::Error;
use crate::plan::PlanNode;
use crate::value::AnnotatedValue;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};

#[async_trait]
pub trait Operator: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn base(&self) -> &OperatorBase;

    fn base_mut(&mut self) -> &mut OperatorBase;

    fn accept(&self, visitor: &mut dyn Visitor);

    /// Fresh, unstarted instance of the same subtree.
    fn copy(&self) -> Box<dyn Operator>;

    fn set_output(&mut self, output: RowSender) {
        self.base_mut().set_output(output);
    }

    /// Handle for stopping this operator from another task.
    fn stop_signal(&self) -> StopSignal {
        self.base().stop_signal()
    }

    fn send_stop(&self) {
        self.base().stop_signal().stop();
    }

    /// Release per-run resources and return the operator (and its
    /// children) to their pools.
    fn done(self: Box<Self>);

    /// Produce every row into the output. Runs at most once per instance;
    /// later calls return `false` immediately. Returns `false` on error,
    /// panic or stop. Errors land in `ctx`.
    async fn run_once(&mut self, ctx: Arc<Context>, parent: Option<AnnotatedValue>) -> bool;
}

/// Instantiate the operator tree for `plan`.
pub fn build_operator(plan: &PlanNode) -> Box<dyn Operator> {
    match plan {
        PlanNode::IndexScan(scan) => IndexScan::new(scan.clone()),
        PlanNode::UnionAll(union) => {
            let children = union.children.iter().map(build_operator).collect();
            UnionAll::new(union.clone(), children)
        }
        PlanNode::Group(group) => {
            let child = build_operator(&group.child);
            Group::new(group.clone(), child)
        }
    }
}

/// Outcome of [`run_plan`].
#[derive(Debug)]
pub struct QueryResult {
    pub rows: Vec<AnnotatedValue>,
    pub errors: Vec<Error>,
    pub success: bool,
    pub profile: Json,
}

/// Run `plan` to completion and collect its rows. Cancelling `ctx` stops
/// the tree and fails the run.
#[instrument(skip_all, fields(request_id = %ctx.request_id(), root = plan.name()))]
pub async fn run_plan(plan: &PlanNode, ctx: Arc<Context>) -> QueryResult {
    let mut root = build_operator(plan);
    let (collector, output) = Collector::new(ctx.config().pipeline_cap);
    root.set_output(output);

    let cancel = ctx.stop_signal();
    let forward = tokio::spawn({
        let cancel = cancel.clone();
        let root_stop = root.stop_signal();
        async move {
            cancel.stopped().await;
            root_stop.stop();
        }
    });

    let (ok, rows) = tokio::join!(root.run_once(ctx.clone(), None), collector.collect(&cancel));
    forward.abort();

    let profile = ProfileVisitor::profile(root.as_ref());
    root.done();

    let errors = ctx.errors();
    let success = ok && errors.is_empty() && !cancel.is_stopped();
    info!(rows = rows.len(), errors = errors.len(), success, "Plan finished");
    QueryResult {
        rows,
        errors,
        success,
        profile,
    }
}
