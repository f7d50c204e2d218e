//! Immutable plan nodes.
//!
//! The planner builds these once per statement; every operator instance
//! built from a node shares it through an `Arc`.

pub mod scan;

pub use scan::{
    IndexGroupAggregatesPlan, IndexScanPlan, KeyspaceTerm, PlanRange, PlanSpan,
};

use crate::algebra::{Aggregate, Expression};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which part of the three-phase aggregation a group node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPhase {
    /// Raw rows in, partial accumulators out.
    Initial,
    /// Partial accumulators in, merged partials out.
    Intermediate,
    /// Partial accumulators in, final results out.
    Final,
}

#[derive(Debug, Clone)]
pub struct UnionAllPlan {
    pub children: Vec<PlanNode>,
}

impl UnionAllPlan {
    pub fn new(children: Vec<PlanNode>) -> Self {
        Self { children }
    }
}

#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub keys: Vec<Expression>,
    pub aggregates: Vec<Arc<dyn Aggregate>>,
    pub phase: GroupPhase,
    pub child: PlanNode,
}

impl GroupPlan {
    pub fn new(phase: GroupPhase, child: PlanNode) -> Self {
        Self {
            keys: Vec::new(),
            aggregates: Vec::new(),
            phase,
            child,
        }
    }

    pub fn with_keys(mut self, keys: Vec<Expression>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_aggregates(mut self, aggregates: Vec<Arc<dyn Aggregate>>) -> Self {
        self.aggregates = aggregates;
        self
    }
}

/// A node of the plan tree.
#[derive(Debug, Clone)]
pub enum PlanNode {
    IndexScan(Arc<IndexScanPlan>),
    UnionAll(Arc<UnionAllPlan>),
    Group(Arc<GroupPlan>),
}

impl PlanNode {
    pub fn name(&self) -> &'static str {
        match self {
            PlanNode::IndexScan(_) => "IndexScan3",
            PlanNode::UnionAll(_) => "UnionAll",
            PlanNode::Group(_) => "Group",
        }
    }
}

impl From<IndexScanPlan> for PlanNode {
    fn from(plan: IndexScanPlan) -> Self {
        PlanNode::IndexScan(Arc::new(plan))
    }
}

impl From<UnionAllPlan> for PlanNode {
    fn from(plan: UnionAllPlan) -> Self {
        PlanNode::UnionAll(Arc::new(plan))
    }
}

impl From<GroupPlan> for PlanNode {
    fn from(plan: GroupPlan) -> Self {
        PlanNode::Group(Arc::new(plan))
    }
}
