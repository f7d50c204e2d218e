//! MAX aggregate.

use super::aggregate::{Aggregate, AggregateBase, AggregateId, AggregateOp};
use super::expression::{EvalContext, Expression};
use crate::error::Result;
use crate::value::{AnnotatedValue, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct Max {
    base: AggregateBase,
}

impl Max {
    pub(crate) fn new(base: AggregateBase) -> Self {
        Self { base }
    }

    /// Null parts never win; an unset (null) accumulator adopts the part;
    /// otherwise the greater value under collation is kept.
    fn cumulate_part(&self, part: Value, cumulative: Value) -> Value {
        if part.is_unknown() {
            cumulative
        } else if cumulative.is_unknown() || part.collate(&cumulative) == Ordering::Greater {
            part
        } else {
            cumulative
        }
    }
}

impl Aggregate for Max {
    fn id(&self) -> AggregateId {
        self.base.id
    }

    fn op(&self) -> AggregateOp {
        AggregateOp::Max
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

#[cfg(test)]
mod tests {
    use super::super::new_aggregate;
    use super::*;
    use std::collections::HashMap;

    fn rows(values: Vec<Value>) -> Vec<AnnotatedValue> {
        values
            .into_iter()
            .map(|v| {
                let mut av = AnnotatedValue::default();
                av.set_field("v", v).unwrap();
                av
            })
            .collect()
    }

    fn inputs() -> Vec<Value> {
        vec![Value::Null, Value::from(3), Value::Missing, Value::from(7), Value::from(2)]
    }

    #[test]
    fn test_max_single_pass() {
        let args: HashMap<String, Value> = HashMap::new();
        let max = new_aggregate(AggregateOp::Max, Some(Expression::path("v")), AggregateId(0));
        let mut acc = max.default_value();
        for row in rows(inputs()) {
            acc = max.cumulate_initial(&row, acc, &args).unwrap();
        }
        assert_eq!(max.compute_final(acc).unwrap(), Value::from(7));
    }

    #[test]
    fn test_unknown_operands_never_change_accumulator() {
        let args: HashMap<String, Value> = HashMap::new();
        let max = new_aggregate(AggregateOp::Max, Some(Expression::path("v")), AggregateId(0));
        for unknown in rows(vec![Value::Null, Value::Missing]) {
            let acc = max.cumulate_initial(&unknown, Value::from(5), &args).unwrap();
            assert_eq!(acc, Value::from(5));
        }
        assert_eq!(
            max.cumulate_intermediate(Value::Null, Value::from(5)).unwrap(),
            Value::from(5)
        );
    }

    #[test]
    fn test_partials_in_any_grouping_match_single_pass() {
        let args: HashMap<String, Value> = HashMap::new();
        let max = new_aggregate(AggregateOp::Max, Some(Expression::path("v")), AggregateId(0));
        let all = rows(inputs());

        let mut single = max.default_value();
        for row in &all {
            single = max.cumulate_initial(row, single, &args).unwrap();
        }

        // every split point, merged in both orders
        for split in 0..=all.len() {
            let (left, right) = all.split_at(split);
            let mut partials = Vec::new();
            for part in [left, right] {
                let mut acc = max.default_value();
                for row in part {
                    acc = max.cumulate_initial(row, acc, &args).unwrap();
                }
                partials.push(acc);
            }
            for order in [[0, 1], [1, 0]] {
                let mut merged = max.default_value();
                for i in order {
                    merged = max.cumulate_intermediate(partials[i].clone(), merged).unwrap();
                }
                assert_eq!(merged, single);
            }
        }
    }

    #[test]
    fn test_mixed_types_follow_collation() {
        let max = new_aggregate(AggregateOp::Max, None, AggregateId(0));
        let acc = max.cumulate_intermediate(Value::from("a"), Value::from(100)).unwrap();
        assert_eq!(acc, Value::from("a"));
    }
}
