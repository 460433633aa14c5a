use std::collections::BTreeMap;

use tracing::warn;

use super::DocumentSet;
use super::Query;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Order in which changes are raised: removals first, then additions,
    /// then modifications.
    pub(crate) fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: Document,
}

impl DocumentViewChange {
    pub fn new(
        change_type: ChangeType,
        doc: Document,
    ) -> Self {
        Self { change_type, doc }
    }
}

/// Collapses successive changes to the same document into one.
#[derive(Clone, Debug, Default)]
pub(crate) struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub(crate) fn track(
        &mut self,
        change: DocumentViewChange,
    ) {
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange::new(old_type, change.doc)),
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.doc)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.doc.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.doc)),
            (old_type, new_type) => {
                warn!(
                    "[DocumentChangeSet] unsupported change {:?} after {:?} for {}",
                    new_type,
                    old_type,
                    key.path().canonical_string()
                );
                Some(change)
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes in key order.
    pub(crate) fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// What a query listener sees after each view update.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    /// Ordered removals, additions, then modifications.
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys of documents in `docs` with pending local writes.
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    /// The view was seeded from a target that had a resume token.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot that reports every document in `docs` as added.
    pub fn from_initial_documents(
        query: Query,
        docs: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = docs
            .iter()
            .map(|doc| DocumentViewChange::new(ChangeType::Added, doc.clone()))
            .collect();
        Self {
            old_docs: docs.empty_like(),
            query,
            docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}
