//! Double dispatch over operator trees.

use super::group::Group;
use super::scan_index::IndexScan;
use super::union::UnionAll;
use super::Operator;
use serde_json::{json, Map, Value as Json};

pub trait Visitor {
    fn visit_index_scan(&mut self, op: &IndexScan);
    fn visit_union_all(&mut self, op: &UnionAll);
    fn visit_group(&mut self, op: &Group);
}

/// Builds a JSON profile of an operator tree after it ran.
#[derive(Debug, Default)]
pub struct ProfileVisitor {
    stack: Vec<Vec<Json>>,
    root: Option<Json>,
}

impl ProfileVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profile(op: &dyn Operator) -> Json {
        let mut visitor = Self::new();
        op.accept(&mut visitor);
        visitor.root.take().unwrap_or(Json::Null)
    }

    fn node(&mut self, op: &dyn Operator, extra: Map<String, Json>, children: &[&dyn Operator]) {
        self.stack.push(Vec::new());
        for child in children {
            child.accept(self);
        }
        let visited = self.stack.pop().unwrap_or_default();

        let times = op.base().times();
        let mut node = Map::new();
        node.insert("#operator".into(), json!(op.name()));
        node.insert(
            "#stats".into(),
            json!({
                "state": format!("{:?}", op.base().state()),
                "execTime": format!("{:?}", times.exec_time()),
                "servTime": format!("{:?}", times.serv_time()),
                "chanTime": format!("{:?}", times.chan_time()),
            }),
        );
        node.extend(extra);
        if !visited.is_empty() {
            node.insert("~children".into(), Json::Array(visited));
        }

        let node = Json::Object(node);
        match self.stack.last_mut() {
            Some(siblings) => siblings.push(node),
            None => self.root = Some(node),
        }
    }
}

impl Visitor for ProfileVisitor {
    fn visit_index_scan(&mut self, op: &IndexScan) {
        let mut extra = Map::new();
        if let Some(plan) = op.plan() {
            extra.insert("index".into(), json!(plan.index.name()));
            extra.insert("keyspace".into(), json!(plan.term.keyspace));
            extra.insert("spans".into(), json!(plan.spans.len()));
            extra.insert("covering".into(), json!(plan.covering()));
            if plan.group_aggs.is_some() {
                extra.insert("index_group_aggs".into(), json!(true));
            }
        }
        self.node(op, extra, &[]);
    }

    fn visit_union_all(&mut self, op: &UnionAll) {
        let children: Vec<&dyn Operator> = op.children().iter().map(|c| c.as_ref()).collect();
        self.node(op, Map::new(), &children);
    }

    fn visit_group(&mut self, op: &Group) {
        let mut extra = Map::new();
        if let Some(plan) = op.plan() {
            let keys: Vec<String> = plan.keys.iter().map(|k| k.text()).collect();
            let aggs: Vec<String> = plan.aggregates.iter().map(|a| a.text()).collect();
            extra.insert("group_keys".into(), json!(keys));
            extra.insert("aggregates".into(), json!(aggs));
        }
        let children: Vec<&dyn Operator> = op.child().into_iter().collect();
        self.node(op, extra, &children);
    }
}
