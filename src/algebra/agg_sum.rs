//! SUM aggregate.

use super::aggregate::{Aggregate, AggregateBase, AggregateId, AggregateOp};
use super::expression::{EvalContext, Expression};
use crate::error::Result;
use crate::value::{AnnotatedValue, Value};

#[derive(Debug, Clone)]
pub struct Sum {
    base: AggregateBase,
}

impl Sum {
    pub(crate) fn new(base: AggregateBase) -> Self {
        Self { base }
    }

    fn cumulate_part(&self, part: Value, cumulative: Value) -> Value {
        match (&part, &cumulative) {
            (Value::Number(_), Value::Number(_)) => part.add(&cumulative),
            (Value::Number(_), _) => part,
            _ => cumulative,
        }
    }
}

impl Aggregate for Sum {
    fn id(&self) -> AggregateId {
        self.base.id
    }

    fn op(&self) -> AggregateOp {
        AggregateOp::Sum
    }

    fn argument(&self) -> Option<&Expression> {
        self.base.argument.as_ref()
    }

    fn default_value(&self) -> Value {
        Value::Null
    }

    /// Only numbers contribute.
    fn cumulate_initial(
        &self,
        item: &AnnotatedValue,
        cumulative: Value,
        ctx: &dyn EvalContext,
    ) -> Result<Value> {
        let item = self.base.evaluate_argument(self.op(), item, ctx)?;
        Ok(self.cumulate_part(item, cumulative))
    }

    fn cumulate_intermediate(&self, part: Value, cumulative: Value) -> Result<Value> {
        Ok(self.cumulate_part(part, cumulative))
    }

    fn compute_final(&self, cumulative: Value) -> Result<Value> {
        Ok(cumulative)
    }
}

#[cfg(test)]
mod tests {
    use super::super::new_aggregate;
    use super::*;

    #[test]
    fn test_sum_ignores_non_numbers() {
        let sum = new_aggregate(AggregateOp::Sum, None, AggregateId(0));
        let mut acc = sum.default_value();
        for part in [Value::from(1.5), Value::from("2"), Value::Null, Value::from(2.5)] {
            acc = sum.cumulate_intermediate(part, acc).unwrap();
        }
        assert_eq!(acc, Value::from(4));
    }

    #[test]
    fn test_sum_of_nothing_is_null() {
        let sum = new_aggregate(AggregateOp::Sum, None, AggregateId(0));
        assert!(sum.compute_final(sum.default_value()).unwrap().is_null());
    }
}
