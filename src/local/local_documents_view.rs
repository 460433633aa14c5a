use tracing::trace;

use super::MutationQueue;
use super::OverlayCache;
use super::RemoteDocumentCache;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;
use crate::model::DocumentMap;
use crate::model::FieldMask;
use crate::model::MutationBatch;
use crate::model::ResourcePath;
use crate::model::SnapshotVersion;

/// Documents as the application sees them: the remote cache with every
/// queued mutation applied.
pub(crate) struct LocalDocumentsView<'a> {
    pub(crate) remote_documents: &'a RemoteDocumentCache,
    pub(crate) mutation_queue: &'a MutationQueue,
    pub(crate) overlays: &'a mut OverlayCache,
}

/// Local views of a collection and how many cached documents were read to
/// produce them.
pub(crate) struct CollectionView {
    pub(crate) documents: DocumentMap,
    pub(crate) documents_read: usize,
}

impl LocalDocumentsView<'_> {
    pub(crate) fn get_document(
        &mut self,
        key: &DocumentKey,
    ) -> Document {
        let base = self.remote_documents.get(key);
        self.get_local_view(&base)
    }

    pub(crate) fn get_documents(
        &mut self,
        keys: &DocumentKeySet,
    ) -> DocumentMap {
        let bases = self.remote_documents.get_all(keys);
        self.get_local_views(bases)
    }

    /// Applies the queued batches for `base`'s key, oldest first, to a copy
    /// of `base`.
    pub(crate) fn get_local_view(
        &mut self,
        base: &Document,
    ) -> Document {
        let queue = self.mutation_queue;
        let batches = queue.all_mutation_batches_affecting_document_key(base.key());
        let Some(largest_batch_id) = batches.last().map(|b| b.batch_id) else {
            return base.clone();
        };
        if let Some(view) = self.overlays.get(base, largest_batch_id) {
            return view;
        }

        let (view, mask) = apply_batches(base, &batches);
        trace!("[LocalDocumentsView] computed view of {} over {} batches", base.key(), batches.len());
        self.overlays.insert(base.clone(), &batches, view.clone(), mask.as_ref());
        view
    }

    pub(crate) fn get_local_views(
        &mut self,
        bases: DocumentMap,
    ) -> DocumentMap {
        bases.into_iter().map(|(key, base)| (key, self.get_local_view(&base))).collect()
    }

    /// Local views of every document directly under `collection`, including
    /// documents that only exist locally.
    ///
    /// With `since_read_time` only remote documents read after it are
    /// considered, but locally mutated documents are always included.
    pub(crate) fn get_documents_matching_collection(
        &mut self,
        collection: &ResourcePath,
        since_read_time: Option<SnapshotVersion>,
    ) -> CollectionView {
        let remote = self.remote_documents;
        let mut bases = remote.get_all_from_collection(collection, since_read_time);
        let documents_read = bases.len();
        for key in self.locally_mutated_keys(collection) {
            if !bases.contains_key(&key) {
                let base = remote.get(&key);
                bases.insert(key, base);
            }
        }

        CollectionView {
            documents: self.get_local_views(bases),
            documents_read,
        }
    }

    /// Local views of the documents under `collection` with queued writes.
    pub(crate) fn get_locally_mutated_in_collection(
        &mut self,
        collection: &ResourcePath,
    ) -> DocumentMap {
        let keys = self.locally_mutated_keys(collection);
        self.get_documents(&keys)
    }

    fn locally_mutated_keys(
        &self,
        collection: &ResourcePath,
    ) -> DocumentKeySet {
        self.mutation_queue
            .all_mutation_batches_affecting_collection(collection)
            .into_iter()
            .flat_map(|batch| batch.mutations.iter())
            .filter(|mutation| collection.is_immediate_parent_of(mutation.key.path()))
            .map(|mutation| mutation.key.clone())
            .collect()
    }
}

/// Replays `batches` on a copy of `base`; returns the view and the fields
/// the batches wrote (`None` for whole-document writes).
pub(crate) fn apply_batches(
    base: &Document,
    batches: &[&MutationBatch],
) -> (Document, Option<FieldMask>) {
    let mut view = base.clone();
    let mut mask = Some(FieldMask::default());
    for batch in batches {
        mask = batch.apply_to_local_view(&mut view, mask);
    }
    (view, mask)
}
