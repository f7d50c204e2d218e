//! Turning plan spans into concrete scan spans.
//!
//! A range built from `key IN $list` only knows its values at run time. Each
//! span containing such a range is replaced by one equality span per distinct
//! list element, as long as the whole set stays within the fanout cap.
//! Above the cap the span is scanned unexpanded and the IN predicate is left
//! to the filter above the scan. An empty list removes the span.

use crate::algebra::{EvalContext, Expression};
use crate::datastore::{Inclusion, ScanRange, ScanSpan};
use crate::error::Result;
use crate::plan::{PlanRange, PlanSpan};
use crate::value::{sorted_distinct, AnnotatedValue, Value};
use tracing::debug;

/// Expand dynamic IN ranges of `spans` against `parent`.
pub fn expand_dynamic_in(
    spans: &[PlanSpan],
    parent: &AnnotatedValue,
    ctx: &dyn EvalContext,
    fanout: usize,
) -> Result<Vec<PlanSpan>> {
    let mut expanded: Vec<PlanSpan> = spans.to_vec();
    let mut numspans = spans.len() as isize;
    let mut min_pos: isize = 0;
    let mut max_pos: isize = 0;

    for span in spans {
        for (i, range) in span.ranges.iter().enumerate() {
            let Some(list) = &range.dynamic_in else {
                continue;
            };

            let values = match list.evaluate(parent, ctx)? {
                Value::Array(values) => sorted_distinct(values),
                _ => continue,
            };

            let grow = (max_pos - min_pos + 1) * (values.len() as isize - 1);
            let new_len = numspans + grow;
            if new_len > fanout as isize {
                debug!(new_len, fanout, "IN list exceeds span fanout, scanning unexpanded");
                continue;
            }

            let previous = std::mem::take(&mut expanded);
            expanded.reserve(new_len as usize);
            let mut added: isize = 0;
            for (j, sp) in previous.into_iter().enumerate() {
                let j = j as isize;
                if j >= min_pos && j <= max_pos {
                    for v in &values {
                        let mut copy = sp.clone();
                        if let Some(nrg) = copy.ranges.get_mut(i) {
                            nrg.low = Some(Expression::Constant(v.clone()));
                            nrg.high = nrg.low.clone();
                            nrg.inclusion = Inclusion::Both;
                        }
                        expanded.push(copy);
                    }
                    added += values.len() as isize - 1;
                } else {
                    expanded.push(sp);
                }
            }
            numspans = expanded.len() as isize;
            max_pos += added;
        }
        min_pos = max_pos + 1;
        max_pos = min_pos;
    }

    Ok(expanded)
}

/// Evaluate every bound. Returns the non-empty spans and whether none
/// survived.
pub fn evaluate_spans(
    spans: &[PlanSpan],
    parent: Option<&AnnotatedValue>,
    has_dynamic_in: bool,
    ctx: &dyn EvalContext,
    fanout: usize,
) -> Result<(Vec<ScanSpan>, bool)> {
    let empty_row = AnnotatedValue::default();
    let parent = parent.unwrap_or(&empty_row);

    let expanded;
    let spans = if has_dynamic_in {
        expanded = expand_dynamic_in(spans, parent, ctx, fanout)?;
        &expanded[..]
    } else {
        spans
    };

    let mut out = Vec::with_capacity(spans.len());
    for span in spans {
        let ranges = span
            .ranges
            .iter()
            .map(|range| evaluate_range(range, parent, ctx))
            .collect::<Result<Vec<_>>>()?;
        let span = ScanSpan::new(ranges);
        if !span.is_empty() {
            out.push(span);
        }
    }

    let empty = out.is_empty();
    Ok((out, empty))
}

fn evaluate_range(range: &PlanRange, parent: &AnnotatedValue, ctx: &dyn EvalContext) -> Result<ScanRange> {
    Ok(ScanRange {
        low: evaluate_bound(range.low.as_ref(), parent, ctx)?,
        high: evaluate_bound(range.high.as_ref(), parent, ctx)?,
        inclusion: range.inclusion,
    })
}

/// A bound evaluating to MISSING leaves that side unbounded.
fn evaluate_bound(
    bound: Option<&Expression>,
    parent: &AnnotatedValue,
    ctx: &dyn EvalContext,
) -> Result<Option<Value>> {
    match bound {
        Some(expr) => match expr.evaluate(parent, ctx)? {
            Value::Missing => Ok(None),
            v => Ok(Some(v)),
        },
        None => Ok(None),
    }
}
