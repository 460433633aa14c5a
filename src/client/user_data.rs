//! Application input for writes and its translation into mutations.
//!
//! [`DocumentData`] holds plain values mixed with [`FieldValue`] sentinels
//! (server timestamps, increments, array unions and removals, field
//! deletes). Sentinels never reach the stored data: each one becomes a
//! field transform, or a masked field without a value for deletes.

use std::collections::BTreeMap;

use crate::model::DocumentKey;
use crate::model::FieldMask;
use crate::model::FieldPath;
use crate::model::FieldTransform;
use crate::model::Mutation;
use crate::model::ObjectValue;
use crate::model::Precondition;
use crate::model::TransformOperation;
use crate::model::Value;
use crate::Error;
use crate::ModelError;
use crate::Result;

/// A field of [`DocumentData`].
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Value(Value),
    Map(BTreeMap<String, FieldValue>),
    /// Replaced by the backend's commit time.
    ServerTimestamp,
    /// Adds the operand to the current numeric value, or to 0.
    Increment(Value),
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    /// Removes the field. Only valid in merges and updates.
    Delete,
}

impl FieldValue {
    pub fn server_timestamp() -> Self {
        FieldValue::ServerTimestamp
    }

    pub fn increment(operand: impl Into<Value>) -> Self {
        FieldValue::Increment(operand.into())
    }

    pub fn array_union(elements: impl IntoIterator<Item = Value>) -> Self {
        FieldValue::ArrayUnion(elements.into_iter().collect())
    }

    pub fn array_remove(elements: impl IntoIterator<Item = Value>) -> Self {
        FieldValue::ArrayRemove(elements.into_iter().collect())
    }

    pub fn delete() -> Self {
        FieldValue::Delete
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Map(fields) => FieldValue::Map(fields.into_iter().map(|(k, v)| (k, v.into())).collect()),
            other => FieldValue::Value(other),
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(json: serde_json::Value) -> Self {
        Value::from(json).into()
    }
}

/// Fields to write, keyed by name.
///
/// For `update` the keys are dotted field paths; elsewhere they are plain
/// field names and nesting is expressed with [`FieldValue::Map`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentData {
    fields: BTreeMap<String, FieldValue>,
}

impl DocumentData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        name: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<serde_json::Value> for DocumentData {
    fn from(json: serde_json::Value) -> Self {
        match FieldValue::from(json) {
            FieldValue::Map(fields) => Self { fields },
            _ => Self::default(),
        }
    }
}

impl From<ObjectValue> for DocumentData {
    fn from(object: ObjectValue) -> Self {
        match FieldValue::from(Value::Map(object.into_map())) {
            FieldValue::Map(fields) => Self { fields },
            _ => Self::default(),
        }
    }
}

/// How a write combines with the existing document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SetOptions {
    /// Replace the whole document.
    #[default]
    Overwrite,
    /// Only touch the fields present in the data.
    Merge,
    /// Only touch the listed fields.
    MergeFields(Vec<FieldPath>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DataSource {
    Set,
    MergeSet,
    Update,
}

#[derive(Debug)]
struct ParseContext {
    source: DataSource,
    /// Leaf paths written, including deletes.
    field_mask: Vec<FieldPath>,
    field_transforms: Vec<FieldTransform>,
}

impl ParseContext {
    fn new(source: DataSource) -> Self {
        Self {
            source,
            field_mask: Vec::new(),
            field_transforms: Vec::new(),
        }
    }

    /// Parses `value` found at `path`. Returns `None` for sentinels.
    fn parse(
        &mut self,
        path: &FieldPath,
        value: &FieldValue,
        top_level: bool,
    ) -> Result<Option<Value>> {
        match value {
            FieldValue::Value(v) => {
                self.field_mask.push(path.clone());
                Ok(Some(v.clone()))
            }
            FieldValue::Map(fields) => {
                if fields.is_empty() {
                    self.field_mask.push(path.clone());
                    return Ok(Some(Value::Map(BTreeMap::new())));
                }
                let mut parsed = BTreeMap::new();
                for (name, child) in fields {
                    let child_path = path.child(name.clone());
                    if let Some(v) = self.parse(&child_path, child, false)? {
                        parsed.insert(name.clone(), v);
                    }
                }
                Ok(Some(Value::Map(parsed)))
            }
            FieldValue::Delete => {
                match self.source {
                    DataSource::Set => {
                        return Err(invalid_data(format!(
                            "field delete at {} needs a merge write",
                            path
                        )))
                    }
                    DataSource::Update if !top_level => {
                        return Err(invalid_data(format!(
                            "field delete at {} must be at the top level of an update",
                            path
                        )))
                    }
                    _ => {}
                }
                self.field_mask.push(path.clone());
                Ok(None)
            }
            FieldValue::ServerTimestamp => self.transform(path, TransformOperation::ServerTimestamp),
            FieldValue::Increment(operand) => {
                if !operand.is_number() {
                    return Err(invalid_data(format!("increment at {} needs a numeric operand", path)));
                }
                self.transform(path, TransformOperation::NumericIncrement(operand.clone()))
            }
            FieldValue::ArrayUnion(elements) => self.transform(path, TransformOperation::ArrayUnion(elements.clone())),
            FieldValue::ArrayRemove(elements) => self.transform(path, TransformOperation::ArrayRemove(elements.clone())),
        }
    }

    fn transform(
        &mut self,
        path: &FieldPath,
        operation: TransformOperation,
    ) -> Result<Option<Value>> {
        self.field_transforms.push(FieldTransform {
            field: path.clone(),
            operation,
        });
        Ok(None)
    }
}

/// Translates a `set` write into a mutation.
pub(crate) fn parse_set_data(
    key: DocumentKey,
    data: &DocumentData,
    options: &SetOptions,
) -> Result<Mutation> {
    let source = match options {
        SetOptions::Overwrite => DataSource::Set,
        SetOptions::Merge | SetOptions::MergeFields(_) => DataSource::MergeSet,
    };
    let mut context = ParseContext::new(source);
    let mut object = ObjectValue::empty();
    for (name, value) in &data.fields {
        let path = FieldPath::from_segments([name.as_str()])?;
        if let Some(v) = context.parse(&path, value, true)? {
            object.set(&path, v);
        }
    }

    match options {
        SetOptions::Overwrite => Ok(Mutation::set(key, object).with_transforms(context.field_transforms)),
        SetOptions::Merge => {
            let mask = FieldMask::new(context.field_mask);
            Ok(Mutation::patch(key, object, mask, Precondition::None).with_transforms(context.field_transforms))
        }
        SetOptions::MergeFields(fields) => {
            for field in fields {
                let in_data = object.field(field).is_some() || context.field_mask.iter().any(|p| p == field);
                let in_transforms = context.field_transforms.iter().any(|t| field.is_prefix_of(&t.field));
                if !in_data && !in_transforms {
                    return Err(invalid_data(format!(
                        "field {} is in the merge fields but missing from the data",
                        field
                    )));
                }
            }
            let mask = FieldMask::new(fields.iter().cloned());
            let transforms = context
                .field_transforms
                .into_iter()
                .filter(|t| mask.covers(&t.field))
                .collect();
            Ok(Mutation::patch(key, object, mask, Precondition::None).with_transforms(transforms))
        }
    }
}

/// Translates an `update` into a patch that requires the document to exist.
/// Keys of `data` are dotted field paths.
pub(crate) fn parse_update_data(
    key: DocumentKey,
    data: &DocumentData,
) -> Result<Mutation> {
    if data.is_empty() {
        return Err(invalid_data("update needs at least one field".to_string()));
    }
    let mut context = ParseContext::new(DataSource::Update);
    let mut object = ObjectValue::empty();
    let mut mask = FieldMask::default();
    for (dotted, value) in &data.fields {
        let path = FieldPath::from_dot_separated(dotted)?;
        if mask.fields().iter().any(|p| p.is_prefix_of(&path) || path.is_prefix_of(p)) {
            return Err(invalid_data(format!("field {} is written twice", path)));
        }
        match value {
            FieldValue::Delete => {
                mask.insert(path);
            }
            _ => {
                if let Some(v) = context.parse(&path, value, true)? {
                    object.set(&path, v);
                    mask.insert(path);
                }
            }
        }
    }
    Ok(Mutation::patch(key, object, mask, Precondition::Exists(true)).with_transforms(context.field_transforms))
}

fn invalid_data(message: String) -> Error {
    ModelError::InvalidData(message).into()
}
