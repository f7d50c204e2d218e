//! Index scan plan node.

use crate::algebra::Expression;
use crate::datastore::{
    Inclusion, Index, IndexAggregate, IndexGroupKey, IndexKeyOrder, IndexProjection,
};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// The keyspace a scan reads, as named in the FROM clause.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyspaceTerm {
    pub namespace: String,
    pub keyspace: String,
    pub alias: String,
    /// Inner side of a nested-loop join.
    pub under_nl: bool,
}

impl KeyspaceTerm {
    pub fn new(keyspace: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            namespace: "default".to_string(),
            keyspace: keyspace.into(),
            alias: alias.into(),
            under_nl: false,
        }
    }

    pub fn under_nl(mut self, under_nl: bool) -> Self {
        self.under_nl = under_nl;
        self
    }
}

/// Bounds on one index key, still as expressions.
#[derive(Debug, Clone, Default)]
pub struct PlanRange {
    pub low: Option<Expression>,
    pub high: Option<Expression>,
    pub inclusion: Inclusion,
    /// IN-list expression this range was derived from, when its bounds are
    /// only known at run time.
    pub dynamic_in: Option<Expression>,
}

impl PlanRange {
    pub fn new(low: Option<Expression>, high: Option<Expression>, inclusion: Inclusion) -> Self {
        Self {
            low,
            high,
            inclusion,
            dynamic_in: None,
        }
    }

    /// `key = expr`
    pub fn equal(expr: Expression) -> Self {
        Self::new(Some(expr.clone()), Some(expr), Inclusion::Both)
    }

    /// `key IN list`, expanded per element at run time.
    pub fn dynamic_in(list: Expression) -> Self {
        Self {
            low: None,
            high: None,
            inclusion: Inclusion::Neither,
            dynamic_in: Some(list),
        }
    }

    pub fn is_dynamic_in(&self) -> bool {
        self.dynamic_in.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanSpan {
    pub ranges: Vec<PlanRange>,
}

impl PlanSpan {
    pub fn new(ranges: Vec<PlanRange>) -> Self {
        Self { ranges }
    }

    /// Span over the whole index.
    pub fn full() -> Self {
        Self::new(vec![PlanRange::default()])
    }
}

/// Grouping and aggregation the planner decided to push into the index.
#[derive(Debug, Clone, Default)]
pub struct IndexGroupAggregatesPlan {
    pub name: String,
    pub group: Vec<IndexGroupKey>,
    pub aggregates: Vec<IndexAggregate>,
    pub depends_on_index_keys: Vec<usize>,
    /// Count each document once even if it has several index entries.
    pub distinct_docid: bool,
    /// The index may return partial aggregates.
    pub partial: bool,
}

/// Index scan plan node
///
/// `covers` lists one expression per index key followed by `meta().id`;
/// for aggregate pushdown the group and aggregate covers follow, addressed
/// by their entry key ids.
#[derive(Clone)]
pub struct IndexScanPlan {
    pub index: Arc<dyn Index>,
    pub term: KeyspaceTerm,
    pub spans: Vec<PlanSpan>,
    pub reverse: bool,
    pub distinct: bool,
    pub projection: Option<IndexProjection>,
    pub order_terms: Vec<IndexKeyOrder>,
    pub group_aggs: Option<IndexGroupAggregatesPlan>,
    pub covers: Vec<Expression>,
    pub filter_covers: Vec<(Expression, Value)>,
    pub offset: Option<Expression>,
    pub limit: Option<Expression>,
    pub has_dynamic_in_span: bool,
}

impl IndexScanPlan {
    pub fn new(index: Arc<dyn Index>, term: KeyspaceTerm, spans: Vec<PlanSpan>) -> Self {
        let has_dynamic_in_span = spans
            .iter()
            .any(|s| s.ranges.iter().any(PlanRange::is_dynamic_in));
        Self {
            index,
            term,
            spans,
            reverse: false,
            distinct: false,
            projection: None,
            order_terms: Vec::new(),
            group_aggs: None,
            covers: Vec::new(),
            filter_covers: Vec::new(),
            offset: None,
            limit: None,
            has_dynamic_in_span,
        }
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    pub fn with_projection(mut self, projection: IndexProjection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_order(mut self, order_terms: Vec<IndexKeyOrder>) -> Self {
        self.order_terms = order_terms;
        self
    }

    pub fn with_group_aggs(mut self, group_aggs: IndexGroupAggregatesPlan) -> Self {
        self.group_aggs = Some(group_aggs);
        self
    }

    pub fn with_covers(mut self, covers: Vec<Expression>) -> Self {
        self.covers = covers;
        self
    }

    pub fn with_filter_covers(mut self, filter_covers: Vec<(Expression, Value)>) -> Self {
        self.filter_covers = filter_covers;
        self
    }

    pub fn with_offset(mut self, offset: Expression) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_limit(mut self, limit: Expression) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Covers for every index key plus `meta(alias).id`, derived from the
    /// index definition.
    pub fn with_index_covers(mut self) -> Self {
        let mut covers: Vec<Expression> = self.index.range_key().to_vec();
        covers.push(Expression::MetaId(self.term.alias.clone()));
        self.covers = covers;
        self
    }

    pub fn covering(&self) -> bool {
        !self.covers.is_empty()
    }
}

impl fmt::Debug for IndexScanPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexScanPlan")
            .field("index", &self.index.name())
            .field("keyspace", &self.term.keyspace)
            .field("alias", &self.term.alias)
            .field("spans", &self.spans.len())
            .field("covering", &self.covering())
            .field("group_aggs", &self.group_aggs.is_some())
            .finish()
    }
}
