//! Value - the JSON-like datum every operator streams.
//!
//! A `Value` represents any document, field, index key or intermediate result
//! seen during query execution. It extends JSON with a distinct `Missing`
//! variant so that absent fields and explicit `null`s can be told apart.
//!
//! # Supported Types
//!
//! Variants are ranked in declaration order. Values of different variants
//! collate by rank; values of the same variant collate structurally.
//!
//! - **Missing**: Field or element that does not exist
//! - **Null**: Explicit `null`
//! - **Boolean**: true or false
//! - **Number**: f64 floating point numbers
//! - **String**: UTF-8 encoded text, collated bytewise
//! - **Array**: Ordered list of values
//! - **Object**: Key-value map with sorted keys
//!
//! # Example
//!
//! ```rust,ignore
//! use photon_query::value::Value;
//!
//! let doc = Value::from(serde_json::json!({"name": "Alice", "age": 30}));
//! let (age, found) = doc.field("age");
//! assert!(found);
//! assert_eq!(age, Value::from(30));
//!
//! let (missing, found) = doc.field("email");
//! assert!(!found);
//! assert!(missing.is_missing());
//! ```

pub mod annotated;
pub mod collate;
pub mod tokens;

pub use annotated::{Accumulators, AnnotatedValue, AGGREGATES_ATTACHMENT, META_ATTACHMENT};
pub use collate::sorted_distinct;
pub use tokens::TokenOptions;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Variant rank of a [`Value`], in collation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Missing,
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Missing => "missing",
            ValueType::Null => "null",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::Object => "object",
        };
        f.write_str(name)
    }
}

/// Value represents a datum flowing through the execution engine.
///
/// Equality and ordering are defined by [`Value::collate`], so values can be
/// used directly as sort and grouping keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Missing,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub const MISSING: Value = Value::Missing;
    pub const NULL: Value = Value::Null;
    pub const TRUE: Value = Value::Boolean(true);
    pub const FALSE: Value = Value::Boolean(false);

    /// Empty object, the starting point for rows built from index entries.
    pub fn empty_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Missing => ValueType::Missing,
            Value::Null => ValueType::Null,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for `Missing` and `Null`, the operands aggregates and
    /// comparisons skip.
    pub fn is_unknown(&self) -> bool {
        self.value_type() <= ValueType::Null
    }

    /// Get as string
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Boolean coercion used by WHERE and HAVING.
    pub fn truth(&self) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(arr) => !arr.is_empty(),
            Value::Object(obj) => !obj.is_empty(),
        }
    }

    /// Immutable snapshot that is safe to keep across operator boundaries.
    pub fn copy(&self) -> Value {
        self.clone()
    }

    /// Working copy that may be mutated in place without affecting `self`.
    ///
    /// Only the top-level container is meant to be modified; nested values
    /// keep value semantics, so editing them requires replacing the field.
    pub fn copy_for_update(&self) -> Value {
        match self {
            Value::Array(arr) => Value::Array(arr.iter().cloned().collect()),
            Value::Object(obj) => Value::Object(obj.clone()),
            other => other.clone(),
        }
    }

    /// Look up an object field. Non-objects and absent fields yield
    /// `Missing` with `false`.
    pub fn field(&self, name: &str) -> (Value, bool) {
        match self {
            Value::Object(obj) => match obj.get(name) {
                Some(v) => (v.clone(), true),
                None => (Value::Missing, false),
            },
            _ => (Value::Missing, false),
        }
    }

    /// Look up an array element. Negative positions count from the end.
    pub fn index(&self, position: i64) -> (Value, bool) {
        match self {
            Value::Array(arr) => {
                let len = arr.len() as i64;
                let pos = if position < 0 { len + position } else { position };
                if (0..len).contains(&pos) {
                    (arr[pos as usize].clone(), true)
                } else {
                    (Value::Missing, false)
                }
            }
            _ => (Value::Missing, false),
        }
    }

    /// Set an object field. Setting `Missing` removes the field.
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match self {
            Value::Object(obj) => {
                if value.is_missing() {
                    obj.remove(name);
                } else {
                    obj.insert(name.to_string(), value);
                }
                Ok(())
            }
            _ => Err(Error::Unsettable(name.to_string())),
        }
    }

    pub fn unset_field(&mut self, name: &str) -> Result<()> {
        match self {
            Value::Object(obj) => {
                obj.remove(name);
                Ok(())
            }
            _ => Err(Error::Unsettable(name.to_string())),
        }
    }

    /// Replace an array element. Positions past the end pad with `Null`.
    pub fn set_index(&mut self, position: i64, value: Value) -> Result<()> {
        match self {
            Value::Array(arr) => {
                let len = arr.len() as i64;
                let pos = if position < 0 { len + position } else { position };
                if pos < 0 {
                    return Err(Error::Unsettable(position.to_string()));
                }
                let pos = pos as usize;
                if pos >= arr.len() {
                    arr.resize(pos + 1, Value::Null);
                }
                arr[pos] = value;
                Ok(())
            }
            _ => Err(Error::Unsettable(position.to_string())),
        }
    }

    /// Sorted field names of an object, empty for other variants.
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            Value::Object(obj) => obj.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Numeric addition under three-valued logic. Non-numeric operands
    /// yield `Null`.
    pub fn add(&self, other: &Value) -> Value {
        if let Some(unknown) = propagate_unknown(self, other) {
            return unknown;
        }
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            _ => Value::Null,
        }
    }

    /// Numeric subtraction under three-valued logic.
    pub fn sub(&self, other: &Value) -> Value {
        if let Some(unknown) = propagate_unknown(self, other) {
            return unknown;
        }
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a - b),
            _ => Value::Null,
        }
    }
}

/// Three-valued short-circuit for binary operations: `Missing` wins over
/// `Null`, which wins over everything else.
pub fn propagate_unknown(left: &Value, right: &Value) -> Option<Value> {
    if left.is_missing() || right.is_missing() {
        Some(Value::Missing)
    } else if left.is_null() || right.is_null() {
        Some(Value::Null)
    } else {
        None
    }
}

// Conversions
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(arr: Vec<Value>) -> Self {
        Value::Array(arr)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => Value::Array(arr.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// JSON has no `missing`: it becomes `null` at the top level, and is dropped
/// from objects and turned into `null` inside arrays.
impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Missing | Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    serde_json::Value::Number(serde_json::Number::from(n as i64))
                } else {
                    serde_json::Number::from_f64(n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Object(obj) => serde_json::Value::Object(
                obj.into_iter()
                    .filter(|(_, v)| !v.is_missing())
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => write!(f, "missing"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", serde_json::Value::String(s.clone())),
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, item) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(obj) => {
                write!(f, "{{")?;
                for (i, (key, value)) in obj.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", serde_json::Value::String(key.clone()), value)?;
                }
                write!(f, "}}")
            }
        }
    }
}
