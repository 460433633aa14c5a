use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use super::DocumentKey;
use super::FieldPath;
use super::Timestamp;

/// A typed field value.
///
/// Values of different types sort by type first:
/// null < bool < number < timestamp < pending server timestamp < string
/// < bytes < reference < array < map. Integers and doubles share the number
/// slot and compare numerically; NaN sorts before every other number and is
/// equal to itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    /// Local placeholder for a server timestamp that has not been resolved
    /// by the backend yet.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous: Option<Box<Value>>,
    },
    String(String),
    Bytes(Vec<u8>),
    Reference(DocumentKey),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    fn type_order(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Double(_) => 2,
            Value::Timestamp(_) => 3,
            Value::ServerTimestamp { .. } => 4,
            Value::String(_) => 5,
            Value::Bytes(_) => 6,
            Value::Reference(_) => 7,
            Value::Array(_) => 8,
            Value::Map(_) => 9,
        }
    }

    /// True when both values occupy the same slot of the cross-type order.
    pub fn same_type_order(
        &self,
        other: &Value,
    ) -> bool {
        self.type_order() == other.type_order()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Double(d) if d.is_nan())
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Whether an array value holds an element equal to `needle`.
    pub fn array_contains(
        &self,
        needle: &Value,
    ) -> bool {
        self.as_array().map(|values| values.contains(needle)).unwrap_or(false)
    }

    /// Converts to JSON. Pending server timestamps become `null`, timestamps
    /// become `{ "seconds", "nanos" }` objects and references their path.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::ServerTimestamp { .. } => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Timestamp(ts) => serde_json::json!({
                "seconds": ts.seconds(),
                "nanos": ts.nanos(),
            }),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect()),
            Value::Reference(key) => serde_json::Value::String(key.path().canonical_string()),
            Value::Array(values) => serde_json::Value::Array(values.iter().map(Value::to_json).collect()),
            Value::Map(fields) => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn compare_numbers(
    left: &Value,
    right: &Value,
) -> Ordering {
    match (left, right) {
        (Value::Integer(l), Value::Integer(r)) => l.cmp(r),
        (Value::Integer(l), Value::Double(r)) => compare_doubles(*l as f64, *r),
        (Value::Double(l), Value::Integer(r)) => compare_doubles(*l, *r as f64),
        (Value::Double(l), Value::Double(r)) => compare_doubles(*l, *r),
        _ => Ordering::Equal,
    }
}

fn compare_doubles(
    left: f64,
    right: f64,
) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

impl Ord for Value {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        let by_type = self.type_order().cmp(&other.type_order());
        if by_type != Ordering::Equal {
            return by_type;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(l), Value::Boolean(r)) => l.cmp(r),
            (Value::Timestamp(l), Value::Timestamp(r)) => l.cmp(r),
            (
                Value::ServerTimestamp {
                    local_write_time: l, ..
                },
                Value::ServerTimestamp {
                    local_write_time: r, ..
                },
            ) => l.cmp(r),
            (Value::String(l), Value::String(r)) => l.cmp(r),
            (Value::Bytes(l), Value::Bytes(r)) => l.cmp(r),
            (Value::Reference(l), Value::Reference(r)) => l.cmp(r),
            (Value::Array(l), Value::Array(r)) => l.cmp(r),
            (Value::Map(l), Value::Map(r)) => l.iter().cmp(r.iter()),
            _ => compare_numbers(self, other),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(values) => Value::Array(values.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(fields) => {
                Value::Map(fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Timestamp> for Value {
    fn from(ts: Timestamp) -> Self {
        Value::Timestamp(ts)
    }
}

/// Set of field paths touched by a write.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(
        &mut self,
        path: FieldPath,
    ) {
        self.fields.insert(path);
    }

    /// Whether `path` lies inside one of the masked fields.
    pub fn covers(
        &self,
        path: &FieldPath,
    ) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union(
        &self,
        other: &FieldMask,
    ) -> FieldMask {
        Self {
            fields: self.fields.union(&other.fields).cloned().collect(),
        }
    }
}

/// Field data of a document: a nested map addressed by [`FieldPath`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectValue {
    fields: BTreeMap<String, Value>,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(
        &self,
        path: &FieldPath,
    ) -> Option<&Value> {
        let mut current = &self.fields;
        let (last, parents) = path.segments().split_last()?;
        for segment in parents {
            match current.get(segment) {
                Some(Value::Map(child)) => current = child,
                _ => return None,
            }
        }
        current.get(last)
    }

    /// Writes `value` at `path`, replacing non-map intermediates with maps.
    pub fn set(
        &mut self,
        path: &FieldPath,
        value: Value,
    ) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            if !matches!(entry, Value::Map(_)) {
                *entry = Value::Map(BTreeMap::new());
            }
            current = match entry {
                Value::Map(child) => child,
                _ => return,
            };
        }
        current.insert(last.clone(), value);
    }

    pub fn delete(
        &mut self,
        path: &FieldPath,
    ) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            current = match current.get_mut(segment) {
                Some(Value::Map(child)) => child,
                _ => return,
            };
        }
        current.remove(last);
    }

    /// Applies a set of writes, `None` deleting the field.
    pub fn set_all(
        &mut self,
        updates: BTreeMap<FieldPath, Option<Value>>,
    ) {
        for (path, value) in updates {
            match value {
                Some(v) => self.set(&path, v),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf paths of this object; empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut mask = FieldMask::default();
        collect_leaf_paths(&self.fields, &[], &mut mask);
        mask
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
        )
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, Value>,
    prefix: &[String],
    mask: &mut FieldMask,
) {
    for (name, value) in fields {
        let mut segments = prefix.to_vec();
        segments.push(name.clone());
        match value {
            Value::Map(child) if !child.is_empty() => collect_leaf_paths(child, &segments, mask),
            _ => {
                if let Ok(path) = FieldPath::from_segments(segments) {
                    mask.insert(path);
                }
            }
        }
    }
}

impl From<BTreeMap<String, Value>> for ObjectValue {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }
}
