//! Expressions evaluated by the execution core.
//!
//! Only the forms the operators need are modelled: constants, field paths,
//! array elements, `meta().id`, named parameters, array constructors and
//! aggregate references. The planner produces these; execution only
//! evaluates them against rows.

use super::aggregate::Aggregate;
use crate::error::{Error, Result};
use crate::value::{AnnotatedValue, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Services an expression may need from the running request.
pub trait EvalContext: Send + Sync {
    /// Value bound to the named query parameter `$name`.
    fn named_arg(&self, name: &str) -> Option<&Value>;
}

impl EvalContext for HashMap<String, Value> {
    fn named_arg(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

#[derive(Debug, Clone)]
pub enum Expression {
    Constant(Value),
    /// Top-level field of the row, usually a keyspace alias.
    Identifier(String),
    Field(Box<Expression>, String),
    Element(Box<Expression>, Box<Expression>),
    /// `meta(alias).id`
    MetaId(String),
    NamedParameter(String),
    ArrayConstruct(Vec<Expression>),
    Aggregate(Arc<dyn Aggregate>),
}

impl Expression {
    pub fn constant(value: impl Into<Value>) -> Self {
        Expression::Constant(value.into())
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Expression::Identifier(name.into())
    }

    /// `alias.f1.f2...` from a dotted path.
    pub fn path(path: &str) -> Self {
        let mut parts = path.split('.');
        let mut expr = Expression::ident(parts.next().unwrap_or_default());
        for part in parts {
            expr = Expression::Field(Box::new(expr), part.to_string());
        }
        expr
    }

    pub fn field(self, name: impl Into<String>) -> Self {
        Expression::Field(Box::new(self), name.into())
    }

    /// Field names leading from `alias` to this expression, for plain
    /// `alias.a.b` paths.
    pub fn field_path(&self, alias: &str) -> Option<Vec<String>> {
        match self {
            Expression::Field(base, name) => {
                let mut path = base.field_path(alias)?;
                path.push(name.clone());
                Some(path)
            }
            Expression::Identifier(name) if name == alias => Some(Vec::new()),
            _ => None,
        }
    }

    pub fn element(self, index: Expression) -> Self {
        Expression::Element(Box::new(self), Box::new(index))
    }

    pub fn param(name: impl Into<String>) -> Self {
        Expression::NamedParameter(name.into())
    }

    pub fn is_constant(&self) -> bool {
        match self {
            Expression::Constant(_) => true,
            Expression::ArrayConstruct(items) => items.iter().all(Expression::is_constant),
            _ => false,
        }
    }

    /// Canonical text. Covers are keyed by this string.
    pub fn text(&self) -> String {
        match self {
            Expression::Constant(v) => v.to_string(),
            Expression::Identifier(name) => format!("`{}`", name),
            Expression::Field(base, name) => format!("({}.`{}`)", base.text(), name),
            Expression::Element(base, index) => format!("({}[{}])", base.text(), index.text()),
            Expression::MetaId(alias) => format!("(meta(`{}`).`id`)", alias),
            Expression::NamedParameter(name) => format!("${}", name),
            Expression::ArrayConstruct(items) => {
                let parts: Vec<String> = items.iter().map(Expression::text).collect();
                format!("[{}]", parts.join(", "))
            }
            Expression::Aggregate(agg) => agg.text(),
        }
    }

    /// Evaluate against a row. A cover whose key equals this expression's
    /// text short-circuits the evaluation.
    pub fn evaluate(&self, item: &AnnotatedValue, ctx: &dyn EvalContext) -> Result<Value> {
        if let Expression::Constant(v) = self {
            return Ok(v.clone());
        }
        if !item.covers().is_empty() {
            if let Some(covered) = item.cover(&self.text()) {
                return Ok(covered.clone());
            }
        }

        match self {
            Expression::Constant(v) => Ok(v.clone()),
            Expression::Identifier(name) => Ok(item.field(name).0),
            Expression::Field(base, name) => Ok(base.evaluate(item, ctx)?.field(name).0),
            Expression::Element(base, index) => {
                let base = base.evaluate(item, ctx)?;
                let index = index.evaluate(item, ctx)?;
                Ok(element_of(&base, &index))
            }
            Expression::MetaId(_) => Ok(item.meta_id()),
            Expression::NamedParameter(name) => ctx.named_arg(name).cloned().ok_or_else(|| {
                Error::evaluation(format!("No value for named parameter ${}", name), self.text())
            }),
            Expression::ArrayConstruct(items) => {
                let values = items
                    .iter()
                    .map(|e| e.evaluate(item, ctx))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(values))
            }
            Expression::Aggregate(agg) => agg.evaluate(item),
        }
    }
}

fn element_of(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Missing, _) | (_, Value::Missing) => Value::Missing,
        (Value::Array(_), Value::Number(n)) if n.fract() == 0.0 => base.index(*n as i64).0,
        (Value::Object(_), Value::String(name)) => base.field(name).0,
        (Value::Null, _) | (_, Value::Null) => Value::Null,
        _ => Value::Missing,
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> AnnotatedValue {
        let mut av = AnnotatedValue::with_key("k1", None);
        av.set_field("b", Value::from(json!({"x": 5, "tags": ["a", "b"]})))
            .unwrap();
        av
    }

    #[test]
    fn test_field_path_under_alias() {
        assert_eq!(
            Expression::path("b.x.y").field_path("b"),
            Some(vec!["x".to_string(), "y".to_string()])
        );
        assert_eq!(Expression::path("c.x").field_path("b"), None);
        assert_eq!(Expression::MetaId("b".into()).field_path("b"), None);
        let elem = Expression::path("b.tags").element(Expression::constant(0));
        assert_eq!(elem.field_path("b"), None);
    }

    #[test]
    fn test_path_evaluation() {
        let args = HashMap::new();
        let av = row();
        assert_eq!(Expression::path("b.x").evaluate(&av, &args).unwrap(), Value::from(5));
        assert!(Expression::path("b.y").evaluate(&av, &args).unwrap().is_missing());
        let elem = Expression::path("b.tags").element(Expression::constant(-1));
        assert_eq!(elem.evaluate(&av, &args).unwrap(), Value::from("b"));
        assert_eq!(
            Expression::MetaId("b".into()).evaluate(&av, &args).unwrap(),
            Value::from("k1")
        );
    }

    #[test]
    fn test_cover_short_circuits() {
        let args = HashMap::new();
        let mut av = AnnotatedValue::default();
        let expr = Expression::path("b.x");
        av.set_cover(expr.text(), Value::from(42));
        assert_eq!(expr.evaluate(&av, &args).unwrap(), Value::from(42));
    }

    #[test]
    fn test_named_parameter() {
        let mut args = HashMap::new();
        args.insert("list".to_string(), Value::from(json!([1, 2])));
        let av = AnnotatedValue::default();
        assert_eq!(
            Expression::param("list").evaluate(&av, &args).unwrap(),
            Value::from(json!([1, 2]))
        );
        let err = Expression::param("other").evaluate(&av, &args).unwrap_err();
        assert!(matches!(err, Error::Evaluation { .. }));
    }

    #[test]
    fn test_text() {
        assert_eq!(Expression::path("b.x").text(), "(`b`.`x`)");
        assert_eq!(
            Expression::ArrayConstruct(vec![Expression::constant(1), Expression::param("p")]).text(),
            "[1, $p]"
        );
    }
}
