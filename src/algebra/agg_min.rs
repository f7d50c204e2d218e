//! MIN aggregate.

use super::aggregate::{Aggregate, AggregateBase, AggregateId, AggregateOp};
use super::expression::{EvalContext, Expression};
use crate::error::Result;
use crate::value::{AnnotatedValue, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct Min {
    base: AggregateBase,
}

impl Min {
    pub(crate) fn new(base: AggregateBase) -> Self {
        Self { base }
    }

    fn cumulate_part(&self, part: Value, cumulative: Value) -> Value {
        if part.is_unknown() {
            cumulative
        } else if cumulative.is_unknown() || part.collate(&cumulative) == Ordering::Less {
            part
        } else {
            cumulative
        }
    }
}

impl Aggregate for Min {
    fn id(&self) -> AggregateId {
        self.base.id
    }

    fn op(&self) -> AggregateOp {
        AggregateOp::Min
    }

    fn argument(&self) -> Option<&Expression> {
        self.base.argument.as_ref()
    }

    fn default_value(&self) -> Value {
        Value::Null
    }

    fn cumulate_initial(
        &self,
        item: &AnnotatedValue,
        cumulative: Value,
        ctx: &dyn EvalContext,
    ) -> Result<Value> {
        let item = self.base.evaluate_argument(self.op(), item, ctx)?;
        if item.is_unknown() {
            return Ok(cumulative);
        }
        Ok(self.cumulate_part(item, cumulative))
    }

    fn cumulate_intermediate(&self, part: Value, cumulative: Value) -> Result<Value> {
        Ok(self.cumulate_part(part, cumulative))
    }

    fn compute_final(&self, cumulative: Value) -> Result<Value> {
        Ok(cumulative)
    }
}
