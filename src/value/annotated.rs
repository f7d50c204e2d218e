//! AnnotatedValue - a streamed row plus its out-of-band state.
//!
//! The scan creates one per index entry; downstream operators enrich it
//! (joins add covers, grouping attaches aggregate accumulators) and the
//! terminal consumer extracts the final columns and drops it.

use super::Value;
use crate::algebra::AggregateId;
use std::collections::{BTreeMap, HashMap};

/// Attachment name reserved for the per-row aggregate accumulators.
pub const AGGREGATES_ATTACHMENT: &str = "aggregates";

/// Attachment name holding document metadata (`meta().id`).
pub const META_ATTACHMENT: &str = "meta";

/// Running accumulator per aggregate function instance, addressed by the id
/// assigned to the aggregate when the plan was built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulators {
    slots: BTreeMap<AggregateId, Value>,
}

impl Accumulators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: AggregateId) -> Option<&Value> {
        self.slots.get(&id)
    }

    pub fn set(&mut self, id: AggregateId, value: Value) {
        self.slots.insert(id, value);
    }

    /// Remove and return the accumulator, leaving the slot empty.
    pub fn take(&mut self, id: AggregateId) -> Option<Value> {
        self.slots.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AggregateId, &Value)> {
        self.slots.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Attachment {
    Value(Value),
    Aggregates(Accumulators),
}

/// A row flowing between operators.
///
/// `Clone` is deep: covers and attachments are never shared between rows.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedValue {
    value: Value,
    covers: HashMap<String, Value>,
    attachments: HashMap<String, Attachment>,
    bit: u8,
}

impl Default for AnnotatedValue {
    fn default() -> Self {
        Self::new(Value::empty_object())
    }
}

impl AnnotatedValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            covers: HashMap::new(),
            attachments: HashMap::new(),
            bit: 0,
        }
    }

    /// Empty document keyed by `id`, optionally seeded with the fields of
    /// an enclosing scope.
    pub fn with_key(id: &str, scope: Option<&AnnotatedValue>) -> Self {
        let value = match scope.map(AnnotatedValue::value) {
            Some(v @ Value::Object(_)) => v.copy_for_update(),
            _ => Value::empty_object(),
        };
        let mut av = Self::new(value);
        let mut meta = Value::empty_object();
        // meta is always an object
        let _ = meta.set_field("id", Value::from(id));
        av.set_attachment(META_ATTACHMENT, meta);
        av
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Document key recorded by the producing scan, if any.
    pub fn meta_id(&self) -> Value {
        match self.attachment(META_ATTACHMENT) {
            Some(meta) => meta.field("id").0,
            None => Value::Missing,
        }
    }

    pub fn set_field(&mut self, name: &str, value: Value) -> crate::error::Result<()> {
        self.value.set_field(name, value)
    }

    pub fn field(&self, name: &str) -> (Value, bool) {
        self.value.field(name)
    }

    pub fn cover(&self, key: &str) -> Option<&Value> {
        self.covers.get(key)
    }

    pub fn set_cover(&mut self, key: impl Into<String>, value: Value) {
        self.covers.insert(key.into(), value);
    }

    pub fn covers(&self) -> &HashMap<String, Value> {
        &self.covers
    }

    pub fn attachment(&self, key: &str) -> Option<&Value> {
        match self.attachments.get(key) {
            Some(Attachment::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn set_attachment(&mut self, key: impl Into<String>, value: Value) {
        self.attachments.insert(key.into(), Attachment::Value(value));
    }

    pub fn remove_attachment(&mut self, key: &str) {
        self.attachments.remove(key);
    }

    /// Aggregate accumulators attached by a grouping operator.
    pub fn aggregates(&self) -> Option<&Accumulators> {
        match self.attachments.get(AGGREGATES_ATTACHMENT) {
            Some(Attachment::Aggregates(accs)) => Some(accs),
            _ => None,
        }
    }

    /// Replace the aggregate accumulators of this row.
    pub fn set_aggregates(&mut self, accumulators: Accumulators) {
        self.attachments.insert(
            AGGREGATES_ATTACHMENT.to_string(),
            Attachment::Aggregates(accumulators),
        );
    }

    pub fn take_aggregates(&mut self) -> Option<Accumulators> {
        match self.attachments.remove(AGGREGATES_ATTACHMENT) {
            Some(Attachment::Aggregates(accs)) => Some(accs),
            Some(other) => {
                self.attachments.insert(AGGREGATES_ATTACHMENT.to_string(), other);
                None
            }
            None => None,
        }
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }

    pub fn set_bit(&mut self, bit: u8) {
        self.bit = bit;
    }
}

impl From<Value> for AnnotatedValue {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}
