//! Materialized result set of one query.
//!
//! A [`View`] turns changed documents into ordered [`ViewSnapshot`]s, keeps
//! limit queries full, and tracks which of its documents the backend has
//! not confirmed (limbo documents).

use tracing::trace;
use tracing::warn;

use super::ChangeType;
use super::DocumentChangeSet;
use super::DocumentComparator;
use super::DocumentSet;
use super::DocumentViewChange;
use super::LimitType;
use super::Query;
use super::ViewSnapshot;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;
use crate::model::DocumentMap;
use crate::network::OnlineState;
use crate::network::TargetChange;
use crate::Error;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Local,
    Synced,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Pending result of [`View::compute_doc_changes`], applied with
/// [`View::apply_changes`].
#[derive(Debug)]
pub(crate) struct ViewDocumentChanges {
    pub(crate) document_set: DocumentSet,
    pub(crate) change_set: DocumentChangeSet,
    pub(crate) mutated_keys: DocumentKeySet,
    /// A limit query lost a document and must be recomputed from the full
    /// local result.
    pub(crate) needs_refill: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ViewChange {
    pub(crate) snapshot: Option<ViewSnapshot>,
    pub(crate) limbo_changes: Vec<LimboDocumentChange>,
}

#[derive(Debug)]
pub(crate) struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    /// The backend marked the target in sync.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend associates with the target.
    synced_documents: DocumentKeySet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
}

impl View {
    pub(crate) fn new(
        query: Query,
        synced_documents: DocumentKeySet,
    ) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
        }
    }

    pub(crate) fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    #[cfg(test)]
    pub(crate) fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    /// Computes the effect of `changes` on the view without applying it.
    ///
    /// Passing the result of a previous call as `previous` continues from
    /// that state; this is how a limit query is refilled from the local
    /// cache.
    pub(crate) fn compute_doc_changes(
        &self,
        changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let refilling = previous.is_some();
        let (mut new_document_set, mut change_set, mut new_mutated_keys) = match previous {
            Some(previous) => (previous.document_set, previous.change_set, previous.mutated_keys),
            None => (
                self.document_set.clone(),
                DocumentChangeSet::default(),
                self.mutated_keys.clone(),
            ),
        };
        let old_document_set = new_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|l| l as usize);
        let full = limit == Some(old_document_set.len());
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if full => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if full => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in changes {
            let old_doc = old_document_set.get(key);
            let new_doc = if self.query.matches(entry) { Some(entry) } else { None };
            let old_doc_had_pending_mutations = old_doc.is_some() && self.mutated_keys.contains(key);
            let new_doc_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations() || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new_doc.clone()));
                            change_applied = true;
                            let moved_past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| self.comparator.compare(new_doc, last).is_gt());
                            let moved_before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| self.comparator.compare(new_doc, first).is_lt());
                            if moved_past_last || moved_before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new_doc.clone()));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_document_set.insert(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            new_mutated_keys.insert(key.clone());
                        } else {
                            new_mutated_keys.remove(key);
                        }
                    }
                    None => {
                        new_document_set.remove(key);
                        new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => new_document_set.last(),
                    LimitType::Last => new_document_set.first(),
                }
                .cloned();
                let Some(evicted) = evicted else {
                    break;
                };
                new_document_set.remove(evicted.key());
                new_mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        if needs_refill && refilling {
            warn!("[View] refill of {} needed another refill", self.query.canonical_id());
            needs_refill = false;
        }

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            mutated_keys: new_mutated_keys,
            needs_refill,
        }
    }

    /// Applies computed changes and returns the snapshot to raise, if any.
    ///
    /// Limbo documents are only recomputed with `limbo_resolution_enabled`
    /// and while the target is not waiting for a reset.
    pub(crate) fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> Result<ViewChange> {
        if doc_changes.needs_refill {
            return Err(Error::internal("cannot apply view changes that need a refill"));
        }
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        changes.sort_by(|a, b| {
            a.change_type
                .rank()
                .cmp(&b.change_type.rank())
                .then_with(|| self.comparator.compare(&a.doc, &b.doc))
        });

        self.apply_target_change(target_change);

        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return Ok(ViewChange {
                snapshot: None,
                limbo_changes,
            });
        }

        trace!(
            "[View] {} raised {} changes, synced={}",
            self.query.canonical_id(),
            changes.len(),
            synced
        );
        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: self.document_set.clone(),
            old_docs,
            doc_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        Ok(ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        })
    }

    /// Going offline marks the view as no longer current so listeners see
    /// `from_cache` results.
    pub(crate) fn apply_online_state_change(
        &mut self,
        online_state: OnlineState,
    ) -> Result<ViewChange> {
        if !(self.current && online_state == OnlineState::Offline) {
            return Ok(ViewChange::default());
        }
        self.current = false;
        let unchanged = ViewDocumentChanges {
            document_set: self.document_set.clone(),
            change_set: DocumentChangeSet::default(),
            mutated_keys: self.mutated_keys.clone(),
            needs_refill: false,
        };
        self.apply_changes(unchanged, false, None, false)
    }

    fn apply_target_change(
        &mut self,
        target_change: Option<&TargetChange>,
    ) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents.extend(change.added_documents.iter().cloned());
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                warn!(
                    "[View] modified document {} was not synced to the target",
                    key.path().canonical_string()
                );
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo_documents = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();

        let removed = old_limbo_documents
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed);
        let added = self
            .limbo_documents
            .difference(&old_limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Added);
        removed.chain(added).collect()
    }

    fn should_be_in_limbo(
        &self,
        doc: &Document,
    ) -> bool {
        !self.synced_documents.contains(doc.key()) && !doc.has_local_mutations()
    }
}

/// An acknowledged write whose result differs from the optimistic one is
/// held back until the watch stream delivers the final document.
pub(crate) fn should_wait_for_synced_document(
    old_doc: &Document,
    new_doc: &Document,
) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}
