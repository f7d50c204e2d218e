//! COUNT aggregate.

use super::aggregate::{Aggregate, AggregateBase, AggregateId, AggregateOp};
use super::expression::{EvalContext, Expression};
use crate::error::Result;
use crate::value::{AnnotatedValue, Value};

#[derive(Debug, Clone)]
pub struct Count {
    base: AggregateBase,
}

impl Count {
    pub(crate) fn new(base: AggregateBase) -> Self {
        Self { base }
    }

    fn cumulate_part(&self, part: Value, cumulative: Value) -> Value {
        match (part, cumulative) {
            (Value::Number(p), Value::Number(c)) => Value::Number(p + c),
            (Value::Number(p), _) => Value::Number(p),
            (_, cumulative) => cumulative,
        }
    }
}

impl Aggregate for Count {
    fn id(&self) -> AggregateId {
        self.base.id
    }

    fn op(&self) -> AggregateOp {
        AggregateOp::Count
    }

    fn argument(&self) -> Option<&Expression> {
        self.base.argument.as_ref()
    }

    fn default_value(&self) -> Value {
        Value::Number(0.0)
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
        Ok(self.cumulate_part(Value::Number(1.0), cumulative))
    }

    fn cumulate_intermediate(&self, part: Value, cumulative: Value) -> Result<Value> {
        Ok(self.cumulate_part(part, cumulative))
    }

    fn compute_final(&self, cumulative: Value) -> Result<Value> {
        if cumulative.is_unknown() {
            return Ok(self.default_value());
        }
        Ok(cumulative)
    }
}
