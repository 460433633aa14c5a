use std::collections::BTreeMap;

use tracing::trace;

use crate::model::calculate_overlay_mutation;
use crate::model::BatchId;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::FieldMask;
use crate::model::Mutation;
use crate::model::MutationBatch;
use crate::model::Timestamp;

/// Memoized local view of one key.
#[derive(Debug, Clone)]
struct OverlayEntry {
    /// Remote document the view was computed from.
    base: Document,
    /// Newest batch folded into the view.
    largest_batch_id: BatchId,
    view: Document,
    /// Net effect of the queued batches as a single mutation. Only kept when
    /// replaying it on another base gives the same view as replaying the
    /// batches.
    overlay: Option<Mutation>,
}

/// Per-key memo of the mutation chain applied on top of the remote document.
///
/// An entry is valid only for the batch chain it was computed from. The
/// local store drops entries for every key a batch touches whenever that
/// batch is queued, acknowledged or rejected. When only the remote base
/// changed, the view is rebuilt from the overlay mutation instead of the
/// whole chain.
#[derive(Debug, Default)]
pub(crate) struct OverlayCache {
    entries: BTreeMap<DocumentKey, OverlayEntry>,
}

impl OverlayCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Memoized view for `base`, if the batch chain is still the one it was
    /// computed from.
    pub(crate) fn get(
        &mut self,
        base: &Document,
        largest_batch_id: BatchId,
    ) -> Option<Document> {
        let entry = self
            .entries
            .get_mut(base.key())
            .filter(|entry| entry.largest_batch_id == largest_batch_id)?;
        if &entry.base == base {
            return Some(entry.view.clone());
        }

        let overlay = entry.overlay.as_ref()?;
        let mut view = base.clone();
        // Overlays carry no transforms, so the write time is not read.
        overlay.apply_to_local_view(&mut view, None, Timestamp::default());
        trace!("[OverlayCache] rebased {} onto a new remote document", base.key());
        entry.base = base.clone();
        entry.view = view.clone();
        Some(view)
    }

    /// Memoizes `view`, computed by replaying `batches` on `base`.
    pub(crate) fn insert(
        &mut self,
        base: Document,
        batches: &[&MutationBatch],
        view: Document,
        mutated_fields: Option<&FieldMask>,
    ) {
        let Some(largest_batch_id) = batches.last().map(|b| b.batch_id) else {
            return;
        };
        let overlay = if is_rebasable(base.key(), batches) {
            calculate_overlay_mutation(&view, mutated_fields)
        } else {
            None
        };
        self.entries.insert(
            base.key().clone(),
            OverlayEntry {
                base,
                largest_batch_id,
                view,
                overlay,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn overlay(
        &self,
        key: &DocumentKey,
    ) -> Option<&Mutation> {
        self.entries.get(key).and_then(|entry| entry.overlay.as_ref())
    }

    pub(crate) fn invalidate<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) {
        for key in keys {
            if self.entries.remove(key).is_some() {
                trace!("[OverlayCache] invalidated {}", key);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Preconditions and transforms depend on the base they were applied to.
fn is_rebasable(
    key: &DocumentKey,
    batches: &[&MutationBatch],
) -> bool {
    batches
        .iter()
        .flat_map(|batch| batch.mutations.iter())
        .filter(|mutation| &mutation.key == key)
        .all(|mutation| mutation.precondition.is_none() && mutation.field_transforms.is_empty())
}
