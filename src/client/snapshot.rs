use crate::core::ChangeType;
use crate::core::Query;
use crate::core::ViewSnapshot;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::FieldPath;
use crate::model::ObjectValue;
use crate::model::SnapshotVersion;
use crate::model::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// The data includes local writes the backend has not acknowledged.
    pub has_pending_writes: bool,
    /// The data may be stale because it was not confirmed by the backend.
    pub from_cache: bool,
}

/// A document as seen by the application. Absent documents have no data.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    document: Option<Document>,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub(crate) fn new(
        key: DocumentKey,
        document: Document,
        has_pending_writes: bool,
        from_cache: bool,
    ) -> Self {
        let document = if document.is_found_document() { Some(document) } else { None };
        Self {
            key,
            document,
            metadata: SnapshotMetadata {
                has_pending_writes,
                from_cache,
            },
        }
    }

    /// Snapshot of a document read from the local cache.
    pub(crate) fn from_local(document: Document) -> Self {
        let has_pending_writes = document.has_local_mutations();
        Self::new(document.key().clone(), document, has_pending_writes, true)
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.key.document_id()
    }

    pub fn exists(&self) -> bool {
        self.document.is_some()
    }

    pub fn data(&self) -> Option<&ObjectValue> {
        self.document.as_ref().map(Document::data)
    }

    /// Value at a dotted field path.
    pub fn get(
        &self,
        field: &str,
    ) -> Option<&Value> {
        let path = FieldPath::from_dot_separated(field).ok()?;
        self.document.as_ref()?.field(&path)
    }

    pub fn version(&self) -> Option<SnapshotVersion> {
        self.document.as_ref().map(Document::version)
    }

    pub fn to_json(&self) -> Option<serde_json::Value> {
        self.data().map(ObjectValue::to_json)
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        self.metadata
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub change_type: ChangeType,
    pub document: DocumentSnapshot,
    /// Position before the change; `None` for additions.
    pub old_index: Option<usize>,
    /// Position after the change; `None` for removals.
    pub new_index: Option<usize>,
}

/// Result set of a query listen or a cache query.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySnapshot {
    query: Query,
    documents: Vec<DocumentSnapshot>,
    changes: Vec<DocumentChange>,
    metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    pub fn changes(&self) -> &[DocumentChange] {
        &self.changes
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        self.metadata
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn keys(&self) -> Vec<DocumentKey> {
        self.documents.iter().map(|d| d.key().clone()).collect()
    }
}

impl From<ViewSnapshot> for QuerySnapshot {
    fn from(snapshot: ViewSnapshot) -> Self {
        let from_cache = snapshot.from_cache;
        let to_document = |doc: &Document| {
            DocumentSnapshot::new(
                doc.key().clone(),
                doc.clone(),
                snapshot.mutated_keys.contains(doc.key()),
                from_cache,
            )
        };
        let documents = snapshot.docs.iter().map(to_document).collect();
        let changes = snapshot
            .doc_changes
            .iter()
            .map(|change| {
                let key = change.doc.key();
                DocumentChange {
                    change_type: change.change_type,
                    document: to_document(&change.doc),
                    old_index: snapshot.old_docs.index_of(key),
                    new_index: snapshot.docs.index_of(key),
                }
            })
            .collect();
        Self {
            metadata: SnapshotMetadata {
                has_pending_writes: snapshot.has_pending_writes(),
                from_cache,
            },
            query: snapshot.query,
            documents,
            changes,
        }
    }
}
