//! Expressions and aggregate functions evaluated by the operators.

pub mod aggregate;
pub mod agg_count;
pub mod agg_max;
pub mod agg_min;
pub mod agg_sum;
pub mod expression;

pub use agg_count::Count;
pub use agg_max::Max;
pub use agg_min::Min;
pub use agg_sum::Sum;
pub use aggregate::{new_aggregate, Aggregate, AggregateId, AggregateIdGenerator, AggregateOp};
pub use expression::{EvalContext, Expression};
