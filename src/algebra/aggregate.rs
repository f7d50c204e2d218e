//! Cumulative aggregation protocol.
//!
//! Every aggregate function reduces in three phases:
//!
//! 1. **Initial**: fold raw rows into an accumulator (`cumulate_initial`).
//! 2. **Intermediate**: merge partial accumulators produced by parallel
//!    workers or by index pushdown (`cumulate_intermediate`).
//! 3. **Final**: turn the accumulator into the visible result
//!    (`compute_final`).
//!
//! Initial and intermediate share one reduction rule per function. That rule
//! is commutative and associative, which is what makes single-pass, parallel
//! and pushed-down aggregation produce the same answer.

use super::expression::{EvalContext, Expression};
use super::{Count, Max, Min, Sum};
use crate::error::{Error, Result};
use crate::value::{AnnotatedValue, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Identity of one aggregate function instance within a plan.
///
/// Accumulators are stored per row under this id, so two textually equal
/// aggregates bound to different plan nodes stay independent while every
/// reference to the same instance shares its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateId(pub u32);

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agg#{}", self.0)
    }
}

/// Hands out aggregate ids while a plan is being built.
#[derive(Debug, Default)]
pub struct AggregateIdGenerator {
    next: AtomicU32,
}

impl AggregateIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> AggregateId {
        AggregateId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Aggregate operation, also used to describe index pushdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Count,
    Max,
    Min,
    Sum,
}

impl AggregateOp {
    pub fn name(self) -> &'static str {
        match self {
            AggregateOp::Count => "count",
            AggregateOp::Max => "max",
            AggregateOp::Min => "min",
            AggregateOp::Sum => "sum",
        }
    }
}

impl std::str::FromStr for AggregateOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "count" => Ok(AggregateOp::Count),
            "max" => Ok(AggregateOp::Max),
            "min" => Ok(AggregateOp::Min),
            "sum" => Ok(AggregateOp::Sum),
            other => Err(Error::InvalidArgument(format!("unknown aggregate {}", other))),
        }
    }
}

pub trait Aggregate: Send + Sync + fmt::Debug {
    fn id(&self) -> AggregateId;

    fn op(&self) -> AggregateOp;

    /// `None` for `COUNT(*)`.
    fn argument(&self) -> Option<&Expression>;

    /// Result for a group with no contributing rows.
    fn default_value(&self) -> Value;

    /// Fold a raw input row into `cumulative`.
    fn cumulate_initial(
        &self,
        item: &AnnotatedValue,
        cumulative: Value,
        ctx: &dyn EvalContext,
    ) -> Result<Value>;

    /// Merge a partial accumulator into `cumulative`.
    fn cumulate_intermediate(&self, part: Value, cumulative: Value) -> Result<Value>;

    fn compute_final(&self, cumulative: Value) -> Result<Value>;

    /// Current accumulator of this aggregate on a grouped row.
    fn evaluate(&self, item: &AnnotatedValue) -> Result<Value> {
        item.aggregates()
            .and_then(|accs| accs.get(self.id()))
            .cloned()
            .ok_or_else(|| {
                Error::evaluation(
                    format!("no accumulator for {} on row", self.id()),
                    self.text(),
                )
            })
    }

    fn text(&self) -> String {
        match self.argument() {
            Some(arg) => format!("{}({})", self.op().name(), arg.text()),
            None => format!("{}(*)", self.op().name()),
        }
    }
}

/// State shared by all aggregate functions.
#[derive(Debug, Clone)]
pub(crate) struct AggregateBase {
    pub(crate) id: AggregateId,
    pub(crate) argument: Option<Expression>,
}

impl AggregateBase {
    /// Evaluate the argument, mapping failures to an aggregate evaluation
    /// error. `COUNT(*)` has no argument and evaluates to `true`.
    pub(crate) fn evaluate_argument(
        &self,
        op: AggregateOp,
        item: &AnnotatedValue,
        ctx: &dyn EvalContext,
    ) -> Result<Value> {
        match &self.argument {
            Some(arg) => arg.evaluate(item, ctx).map_err(|e| {
                Error::evaluation(e, format!("aggregate {}", op.name()))
            }),
            None => Ok(Value::TRUE),
        }
    }
}

/// Build the aggregate implementing `op`.
pub fn new_aggregate(op: AggregateOp, argument: Option<Expression>, id: AggregateId) -> Arc<dyn Aggregate> {
    let base = AggregateBase { id, argument };
    match op {
        AggregateOp::Count => Arc::new(Count::new(base)),
        AggregateOp::Max => Arc::new(Max::new(base)),
        AggregateOp::Min => Arc::new(Min::new(base)),
        AggregateOp::Sum => Arc::new(Sum::new(base)),
    }
}
