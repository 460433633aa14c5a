use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use super::DocumentKey;
use super::FieldPath;
use super::ObjectValue;
use super::SnapshotVersion;
use super::Value;

pub type DocumentKeySet = BTreeSet<DocumentKey>;
pub type DocumentMap = BTreeMap<DocumentKey, Document>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Placeholder for a key nothing is known about.
    Invalid,
    FoundDocument,
    /// The document is known not to exist at `version`.
    NoDocument,
    /// The document exists but its contents are unknown, e.g. after a
    /// server-side patch could not be replayed locally.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    /// Local view includes mutations that have not been acknowledged.
    HasLocalMutations,
    /// Acknowledged by the backend but not yet seen on the watch stream.
    HasCommittedMutations,
}

/// A cached or locally computed document.
///
/// The same type represents every lifecycle stage; the `convert_*` methods
/// move a document between them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: ObjectValue,
    document_state: DocumentState,
}

impl Document {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::MIN,
            read_time: SnapshotVersion::MIN,
            data: ObjectValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_found(
        key: DocumentKey,
        version: SnapshotVersion,
        data: ObjectValue,
    ) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_found_document(version, data);
        doc
    }

    pub fn new_no_document(
        key: DocumentKey,
        version: SnapshotVersion,
    ) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_no_document(version);
        doc
    }

    pub fn new_unknown(
        key: DocumentKey,
        version: SnapshotVersion,
    ) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_unknown_document(version);
        doc
    }

    pub fn convert_to_found_document(
        &mut self,
        version: SnapshotVersion,
        data: ObjectValue,
    ) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(
        &mut self,
        version: SnapshotVersion,
    ) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = ObjectValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(
        &mut self,
        version: SnapshotVersion,
    ) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = ObjectValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self
    }

    pub fn set_read_time(
        &mut self,
        read_time: SnapshotVersion,
    ) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ObjectValue {
        &mut self.data
    }

    pub fn field(
        &self,
        path: &FieldPath,
    ) -> Option<&Value> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }
}
