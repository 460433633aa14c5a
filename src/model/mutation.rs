//! Document writes and the rules for replaying them on cached documents.
//!
//! A mutation is applied in two places: optimistically on the local view
//! while it sits in the queue, and on the remote document once the backend
//! acknowledged it together with the resolved transform results.

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use super::Document;
use super::DocumentKey;
use super::FieldMask;
use super::FieldPath;
use super::ObjectValue;
use super::SnapshotVersion;
use super::Timestamp;
use super::Value;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    /// The document must exist (`true`) or be absent (`false`).
    Exists(bool),
    /// The document must exist at exactly this version.
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(
        &self,
        doc: &Document,
    ) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == doc.is_found_document(),
            Precondition::UpdateTime(version) => doc.is_found_document() && doc.version() == *version,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    NumericIncrement(Value),
}

impl TransformOperation {
    /// Value computed locally from the field's `previous` value.
    fn apply_to_local_view(
        &self,
        previous: Option<&Value>,
        local_write_time: Timestamp,
    ) -> Value {
        match self {
            TransformOperation::ServerTimestamp => {
                let previous = match previous {
                    Some(Value::ServerTimestamp { previous, .. }) => previous.clone(),
                    Some(other) => Some(Box::new(other.clone())),
                    None => None,
                };
                Value::ServerTimestamp {
                    local_write_time,
                    previous,
                }
            }
            TransformOperation::ArrayUnion(elements) => {
                let mut values = coerce_array(previous);
                for element in elements {
                    if !values.contains(element) {
                        values.push(element.clone());
                    }
                }
                Value::Array(values)
            }
            TransformOperation::ArrayRemove(elements) => {
                let mut values = coerce_array(previous);
                values.retain(|v| !elements.contains(v));
                Value::Array(values)
            }
            TransformOperation::NumericIncrement(operand) => {
                let base = match previous {
                    Some(v) if v.is_number() => v.clone(),
                    _ => Value::Integer(0),
                };
                add_numbers(&base, operand)
            }
        }
    }
}

fn coerce_array(previous: Option<&Value>) -> Vec<Value> {
    match previous {
        Some(Value::Array(values)) => values.clone(),
        _ => Vec::new(),
    }
}

fn add_numbers(
    base: &Value,
    operand: &Value,
) -> Value {
    match (base, operand) {
        (Value::Integer(l), Value::Integer(r)) => Value::Integer(l.saturating_add(*r)),
        _ => Value::Double(base.as_f64().unwrap_or(0.0) + operand.as_f64().unwrap_or(0.0)),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set(ObjectValue),
    /// Writes the fields in `mask`; masked fields missing from `data` are
    /// deleted.
    Patch { data: ObjectValue, mask: FieldMask },
    Delete,
    /// Checks the precondition without writing.
    Verify,
}

/// Outcome of replaying a mutation on the local view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalApply {
    /// Fields written so far; `None` means the whole document.
    Applied(Option<FieldMask>),
    /// The precondition did not hold; the document is unchanged.
    PreconditionFailed,
}

/// Result of one mutation as reported by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Version of the document after the write; the commit version for
    /// deletes.
    pub version: SnapshotVersion,
    /// Resolved transform values, one per field transform.
    pub transform_results: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: DocumentKey,
    pub kind: MutationKind,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

impl Mutation {
    pub fn set(
        key: DocumentKey,
        data: ObjectValue,
    ) -> Self {
        Self {
            key,
            kind: MutationKind::Set(data),
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(
        key: DocumentKey,
        data: ObjectValue,
        mask: FieldMask,
        precondition: Precondition,
    ) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { data, mask },
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(
        key: DocumentKey,
        precondition: Precondition,
    ) -> Self {
        Self {
            key,
            kind: MutationKind::Verify,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(
        mut self,
        precondition: Precondition,
    ) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(
        mut self,
        field_transforms: Vec<FieldTransform>,
    ) -> Self {
        self.field_transforms = field_transforms;
        self
    }

    /// Fields written by this mutation; `None` for whole-document writes.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => {
                let mut mask = mask.clone();
                for transform in &self.field_transforms {
                    mask.insert(transform.field.clone());
                }
                Some(mask)
            }
            _ => None,
        }
    }

    /// Replays the mutation on the local view of `doc`.
    ///
    /// `previous_mask` holds the fields written by earlier mutations of the
    /// same key. A failed precondition leaves `doc` untouched.
    pub fn apply_to_local_view(
        &self,
        doc: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> LocalApply {
        if !self.precondition.is_valid_for(doc) {
            return LocalApply::PreconditionFailed;
        }

        match &self.kind {
            MutationKind::Set(value) => {
                let mut data = value.clone();
                self.apply_local_transforms(doc, &mut data, local_write_time);
                doc.convert_to_found_document(doc.version(), data).set_has_local_mutations();
                LocalApply::Applied(None)
            }
            MutationKind::Patch { data: patch, mask } => {
                let mut data = doc.data().clone();
                apply_patch(&mut data, patch, mask);
                self.apply_local_transforms(doc, &mut data, local_write_time);
                doc.convert_to_found_document(doc.version(), data).set_has_local_mutations();
                LocalApply::Applied(previous_mask.map(|previous| {
                    let mut merged = previous.union(mask);
                    for transform in &self.field_transforms {
                        merged.insert(transform.field.clone());
                    }
                    merged
                }))
            }
            MutationKind::Delete => {
                doc.convert_to_no_document(doc.version()).set_has_local_mutations();
                LocalApply::Applied(None)
            }
            MutationKind::Verify => LocalApply::Applied(previous_mask),
        }
    }

    /// Applies the acknowledged mutation to the remote copy of `doc`.
    pub fn apply_to_remote_document(
        &self,
        doc: &mut Document,
        result: &MutationResult,
    ) {
        match &self.kind {
            MutationKind::Set(value) => {
                let mut data = value.clone();
                self.apply_server_transforms(&mut data, result);
                doc.convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data: patch, mask } => {
                if !self.precondition.is_valid_for(doc) {
                    // The backend applied the patch to a document we do not
                    // have; its contents are unknown until the next watch
                    // update.
                    doc.convert_to_unknown_document(result.version);
                    return;
                }
                let mut data = doc.data().clone();
                apply_patch(&mut data, patch, mask);
                self.apply_server_transforms(&mut data, result);
                doc.convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                doc.convert_to_no_document(result.version).set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    fn apply_local_transforms(
        &self,
        doc: &Document,
        data: &mut ObjectValue,
        local_write_time: Timestamp,
    ) {
        for transform in &self.field_transforms {
            let previous = doc.field(&transform.field);
            let value = transform.operation.apply_to_local_view(previous, local_write_time);
            data.set(&transform.field, value);
        }
    }

    fn apply_server_transforms(
        &self,
        data: &mut ObjectValue,
        result: &MutationResult,
    ) {
        if result.transform_results.len() != self.field_transforms.len() {
            warn!(
                "transform result count {} does not match {} transforms for {}",
                result.transform_results.len(),
                self.field_transforms.len(),
                self.key
            );
        }
        for (transform, value) in self.field_transforms.iter().zip(&result.transform_results) {
            data.set(&transform.field, value.clone());
        }
    }
}

fn apply_patch(
    data: &mut ObjectValue,
    patch: &ObjectValue,
    mask: &FieldMask,
) {
    for path in mask.fields() {
        match patch.field(path) {
            Some(value) => data.set(path, value.clone()),
            None => data.delete(path),
        }
    }
}

/// Builds the single mutation that turns the remote document into `doc`.
///
/// `doc` is the local view after all queued mutations and `mask` the fields
/// they wrote (`None` for the whole document). Returns `None` when the view
/// has no local mutations.
pub fn calculate_overlay_mutation(
    doc: &Document,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !doc.has_local_mutations() || mask.map(FieldMask::is_empty).unwrap_or(false) {
        return None;
    }

    let Some(mask) = mask else {
        if doc.is_no_document() {
            return Some(Mutation::delete(doc.key().clone()));
        }
        return Some(Mutation::set(doc.key().clone(), doc.data().clone()));
    };

    let mut patch = ObjectValue::empty();
    let mut mask_set = FieldMask::default();
    for path in mask.fields() {
        if mask_set.covers(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = doc.field(&path);
        if value.is_none() && path.len() > 1 {
            if let Some(parent) = path.parent() {
                path = parent;
                value = doc.field(&path);
            }
        }
        match value {
            Some(v) => patch.set(&path, v.clone()),
            None => patch.delete(&path),
        }
        mask_set.insert(path);
    }
    Some(Mutation::patch(doc.key().clone(), patch, mask_set, Precondition::None))
}
