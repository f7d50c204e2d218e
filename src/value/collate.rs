//! Total order, three-valued equality and successors for [`Value`].
//!
//! The same order drives ORDER BY, GROUP BY key equality and the comparison
//! of index keys against span bounds, so it must be total over every variant:
//!
//! ```text
//! missing < null < false < true < numbers < strings < arrays < objects
//! ```
//!
//! Numbers compare by magnitude with `NaN` above every other number. Strings
//! compare bytewise. Arrays compare element-wise, a proper prefix sorting
//! first. Objects compare by field count, then by sorted field names, then by
//! values in field-name order.

use super::{propagate_unknown, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

impl Value {
    /// Total order over all values.
    pub fn collate(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Missing, Value::Missing) | (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => collate_numbers(*a, *b),
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Array(a), Value::Array(b)) => collate_arrays(a, b),
            (Value::Object(a), Value::Object(b)) => collate_objects(a, b),
            _ => self.value_type().cmp(&other.value_type()),
        }
    }

    /// [`Value::collate`] as -1, 0 or 1.
    pub fn collate_int(&self, other: &Value) -> i32 {
        match self.collate(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// Three-valued equality: `Missing` or `Null` when either side is
    /// unknown, otherwise a boolean.
    pub fn equals(&self, other: &Value) -> Value {
        if let Some(unknown) = propagate_unknown(self, other) {
            return unknown;
        }
        Value::Boolean(self.collate(other) == Ordering::Equal)
    }

    /// Three-valued comparison yielding -1, 0 or 1 as a number.
    pub fn compare(&self, other: &Value) -> Value {
        if let Some(unknown) = propagate_unknown(self, other) {
            return unknown;
        }
        Value::Number(self.collate_int(other) as f64)
    }

    /// Strict structural equality used to normalize plans. Unlike
    /// [`Value::equals`] two `Null`s (or two `Missing`s) are equivalent and
    /// the variant must match exactly.
    pub fn equivalent_to(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Missing, Value::Missing) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits() || a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equivalent_to(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.equivalent_to(vb))
            }
            _ => false,
        }
    }

    /// A value that collates strictly after `self`, used to turn an
    /// inclusive upper span bound into an exclusive one.
    pub fn successor(&self) -> Value {
        match self {
            Value::Missing => Value::Null,
            Value::Null => Value::Boolean(false),
            Value::Boolean(false) => Value::Boolean(true),
            Value::Boolean(true) => Value::Number(f64::NEG_INFINITY),
            Value::Number(n) if n.is_nan() => Value::String(String::new()),
            Value::Number(n) if *n == f64::INFINITY => Value::Number(f64::NAN),
            Value::Number(n) => Value::Number(next_up(*n)),
            // Space is the lowest printable byte.
            Value::String(s) => Value::String(format!("{} ", s)),
            Value::Array(arr) => {
                let mut next = arr.clone();
                next.push(Value::Null);
                Value::Array(next)
            }
            Value::Object(obj) => {
                let mut next = obj.clone();
                let mut key = String::new();
                while next.contains_key(&key) {
                    key.push('\u{0}');
                }
                next.insert(key, Value::Null);
                Value::Object(next)
            }
        }
    }
}

fn collate_numbers(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn collate_arrays(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let cmp = x.collate(y);
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    a.len().cmp(&b.len())
}

fn collate_objects(a: &BTreeMap<String, Value>, b: &BTreeMap<String, Value>) -> Ordering {
    let by_len = a.len().cmp(&b.len());
    if by_len != Ordering::Equal {
        return by_len;
    }

    let by_keys = a.keys().map(|k| k.as_bytes()).cmp(b.keys().map(|k| k.as_bytes()));
    if by_keys != Ordering::Equal {
        return by_keys;
    }

    for (x, y) in a.values().zip(b.values()) {
        let cmp = x.collate(y);
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

/// Next representable f64 above a finite `n`.
fn next_up(n: f64) -> f64 {
    if n == 0.0 {
        return f64::from_bits(1);
    }
    let bits = n.to_bits();
    if n > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.collate(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.collate(other)
    }
}

/// Sort under collation and drop duplicates.
pub fn sorted_distinct(mut values: Vec<Value>) -> Vec<Value> {
    values.sort();
    values.dedup();
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Vec<Value> {
        vec![
            Value::Missing,
            Value::Null,
            Value::from(false),
            Value::from(true),
            Value::from(f64::NEG_INFINITY),
            Value::from(-2.5),
            Value::from(0),
            Value::from(7),
            Value::from(f64::NAN),
            Value::from(""),
            Value::from("abc"),
            Value::from("abd"),
            Value::from(json!([])),
            Value::from(json!([1])),
            Value::from(json!([1, 2])),
            Value::from(json!([2])),
            Value::from(json!({})),
            Value::from(json!({"a": 2})),
            Value::from(json!({"b": 1})),
            Value::from(json!({"a": 1, "b": 1})),
        ]
    }

    #[test]
    fn test_sample_is_strictly_ascending() {
        let values = sample();
        for pair in values.windows(2) {
            assert_eq!(
                pair[0].collate(&pair[1]),
                Ordering::Less,
                "{} should collate below {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_antisymmetric_and_transitive() {
        let values = sample();
        for a in &values {
            for b in &values {
                assert_eq!(a.collate(b), b.collate(a).reverse());
                for c in &values {
                    if a.collate(b) != Ordering::Greater && b.collate(c) != Ordering::Greater {
                        assert_ne!(a.collate(c), Ordering::Greater);
                    }
                }
            }
        }
    }

    #[test]
    fn test_rank_dominates_structure() {
        let long_string = Value::from("zzzzzzzzzzzzzz");
        let empty_array = Value::from(json!([]));
        assert_eq!(long_string.collate(&empty_array), Ordering::Less);
        assert_eq!(Value::from(1e300).collate(&Value::from("")), Ordering::Less);
        assert_eq!(empty_array.collate(&Value::empty_object()), Ordering::Less);
    }

    #[test]
    fn test_three_valued_equals() {
        let values = sample();
        for x in &values {
            assert!(Value::Missing.equals(x).is_missing());
            assert!(x.equals(&Value::Missing).is_missing());
            if !x.is_missing() {
                assert!(Value::Null.equals(x).is_null());
                assert!(x.equals(&Value::Null).is_null());
            }
        }
        assert_eq!(Value::from(1).equals(&Value::from(1.0)), Value::TRUE);
        assert_eq!(Value::from("a").equals(&Value::from(1)), Value::FALSE);
        assert_eq!(Value::from(2).compare(&Value::from(1)), Value::from(1));
        assert!(Value::Null.compare(&Value::Missing).is_missing());
    }

    #[test]
    fn test_equivalent_to_is_strict() {
        assert!(Value::Null.equivalent_to(&Value::Null));
        assert!(!Value::Null.equivalent_to(&Value::Missing));
        assert!(Value::from(json!({"a": [1, null]})).equivalent_to(&Value::from(json!({"a": [1, null]}))));
        assert!(!Value::from(json!([1])).equivalent_to(&Value::from(json!([1, 2]))));
    }

    #[test]
    fn test_string_successor() {
        let abc = Value::from("abc");
        let next = abc.successor();
        assert_eq!(abc.collate(&next), Ordering::Less);
        assert_eq!(next.collate(&Value::from("abd")), Ordering::Less);
    }

    #[test]
    fn test_successor_is_greater_everywhere() {
        let mut values = sample();
        values.push(Value::from(f64::INFINITY));
        values.push(Value::from(-0.0));
        values.push(Value::from(json!({"": null})));
        for v in values {
            assert_eq!(v.collate(&v.successor()), Ordering::Less, "successor of {}", v);
        }
    }

    #[test]
    fn test_sorted_distinct() {
        let values = vec![Value::from(3), Value::from(1), Value::from(2), Value::from(2), Value::from(1.0)];
        assert_eq!(
            sorted_distinct(values),
            vec![Value::from(1), Value::from(2), Value::from(3)]
        );
    }
}
