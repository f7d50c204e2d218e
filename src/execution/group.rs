//! Grouping operator driving the three-phase aggregate protocol.
//!
//! The child runs into a private pipeline while this operator folds its rows
//! into one accumulator table per group key. Groups are emitted in key
//! order once the child is exhausted.

use super::base::{row_channel, OperatorBase, RowReceiver, StopSignal};
use super::context::{Context, Phase};
use super::pool::{OperatorPool, Recycle};
use super::visitor::Visitor;
use super::Operator;
use crate::algebra::Expression;
use crate::error::{Error, Result};
use crate::plan::{GroupPhase, GroupPlan};
use crate::value::{Accumulators, AnnotatedValue, Value};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

lazy_static::lazy_static! {
    static ref GROUP_POOL: OperatorPool<Group> = OperatorPool::from_env("group");
}

#[derive(Debug, Default)]
pub struct Group {
    base: OperatorBase,
    plan: Option<Arc<GroupPlan>>,
    child: Option<Box<dyn Operator>>,
}

struct GroupEntry {
    row: AnnotatedValue,
    accumulators: Vec<Value>,
}

impl Group {
    pub fn new(plan: Arc<GroupPlan>, child: Box<dyn Operator>) -> Box<Self> {
        let mut op = GROUP_POOL.get();
        op.plan = Some(plan);
        op.child = Some(child);
        op
    }

    pub fn plan(&self) -> Option<&Arc<GroupPlan>> {
        self.plan.as_ref()
    }

    pub fn child(&self) -> Option<&dyn Operator> {
        self.child.as_deref()
    }

    async fn execute(&mut self, ctx: &Arc<Context>, parent: Option<AnnotatedValue>) -> Result<bool> {
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| Error::Internal("group without plan".into()))?;
        let mut child = self
            .child
            .take()
            .ok_or_else(|| Error::Internal("group without child".into()))?;

        let (tx, rx) = row_channel(ctx.config().pipeline_cap);
        child.set_output(tx);
        let child_stop = child.stop_signal();
        let own_stop = self.base.stop_signal();

        let (child_ok, groups) = tokio::join!(
            child.run_once(ctx.clone(), parent),
            fold(&plan, rx, ctx, &own_stop, &child_stop)
        );
        self.child = Some(child);

        let groups = groups?;
        if !child_ok || own_stop.is_stopped() {
            if own_stop.is_stopped() {
                self.base.mark_stopped();
            }
            return Ok(false);
        }

        let count = groups.len() as u64;
        for entry in emit(&plan, groups)? {
            if !self.base.send_item(entry).await {
                break;
            }
        }
        ctx.add_phase_count(Phase::Group, count);
        Ok(!self.base.is_stopped())
    }
}

/// Fold every input row into its group.
async fn fold(
    plan: &GroupPlan,
    mut rx: RowReceiver,
    ctx: &Context,
    own_stop: &StopSignal,
    child_stop: &StopSignal,
) -> Result<BTreeMap<Vec<Value>, GroupEntry>> {
    let mut groups: BTreeMap<Vec<Value>, GroupEntry> = BTreeMap::new();

    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = own_stop.stopped() => {
                child_stop.stop();
                rx.close();
                return Ok(groups);
            }
        };
        let Some(item) = item else {
            break;
        };

        let key = match plan
            .keys
            .iter()
            .map(|k| k.evaluate(&item, ctx))
            .collect::<Result<Vec<_>>>()
        {
            Ok(key) => key,
            Err(err) => {
                child_stop.stop();
                rx.close();
                return Err(err);
            }
        };

        let entry = groups.entry(key).or_insert_with(|| GroupEntry {
            row: item.clone(),
            accumulators: plan.aggregates.iter().map(|a| a.default_value()).collect(),
        });

        for (agg, slot) in plan.aggregates.iter().zip(entry.accumulators.iter_mut()) {
            let cumulative = std::mem::replace(slot, Value::Null);
            let next = match plan.phase {
                GroupPhase::Initial => agg.cumulate_initial(&item, cumulative, ctx),
                // Partials arrive as accumulators from an upstream group or
                // as covers from an index pushdown.
                GroupPhase::Intermediate | GroupPhase::Final => Expression::Aggregate(agg.clone())
                    .evaluate(&item, ctx)
                    .and_then(|part| agg.cumulate_intermediate(part, cumulative)),
            };
            match next {
                Ok(v) => *slot = v,
                Err(err) => {
                    child_stop.stop();
                    rx.close();
                    return Err(err);
                }
            }
        }
    }

    Ok(groups)
}

/// Rows carrying each group's accumulators, in key order. Without group keys
/// an empty input still yields one row of defaults.
fn emit(plan: &GroupPlan, mut groups: BTreeMap<Vec<Value>, GroupEntry>) -> Result<Vec<AnnotatedValue>> {
    if groups.is_empty() && plan.keys.is_empty() {
        groups.insert(
            Vec::new(),
            GroupEntry {
                row: AnnotatedValue::default(),
                accumulators: plan.aggregates.iter().map(|a| a.default_value()).collect(),
            },
        );
    }

    groups
        .into_values()
        .map(|mut entry| {
            let mut table = Accumulators::new();
            for (agg, acc) in plan.aggregates.iter().zip(entry.accumulators) {
                let value = match plan.phase {
                    GroupPhase::Final => agg.compute_final(acc)?,
                    GroupPhase::Initial | GroupPhase::Intermediate => acc,
                };
                table.set(agg.id(), value);
            }
            entry.row.set_aggregates(table);
            Ok(entry.row)
        })
        .collect()
}

impl Recycle for Group {
    fn recycle(&mut self) {
        self.base.recycle();
        self.plan = None;
        self.child = None;
    }
}

#[async_trait]
impl Operator for Group {
    fn name(&self) -> &'static str {
        match self.plan.as_ref().map(|p| p.phase) {
            Some(GroupPhase::Initial) => "InitialGroup",
            Some(GroupPhase::Intermediate) => "IntermediateGroup",
            Some(GroupPhase::Final) | None => "FinalGroup",
        }
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn accept(&self, visitor: &mut dyn Visitor) {
        visitor.visit_group(self);
    }

    fn copy(&self) -> Box<dyn Operator> {
        let mut op = GROUP_POOL.get();
        op.plan = self.plan.clone();
        op.base = self.base.copy();
        op.child = self.child.as_ref().map(|c| c.copy());
        op
    }

    fn done(mut self: Box<Self>) {
        if let Some(child) = self.child.take() {
            child.done();
        }
        GROUP_POOL.put(self);
    }

    #[instrument(skip_all, fields(request_id = %ctx.request_id()))]
    async fn run_once(&mut self, ctx: Arc<Context>, parent: Option<AnnotatedValue>) -> bool {
        if !self.base.begin() {
            return false;
        }

        let ok = ctx.recover(self.name(), self.execute(&ctx, parent)).await;

        self.base.finish(&ctx, Phase::Group);
        debug!(ok, "Group done");
        ok
    }
}
