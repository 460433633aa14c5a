use std::collections::BTreeMap;

use crate::core::TargetPurpose;
use crate::model::DocumentKeySet;
use crate::model::DocumentMap;
use crate::model::SnapshotVersion;
use crate::model::TargetId;

/// Changes the backend reported for one target since the last snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetChange {
    /// Empty when the backend sent no new token.
    pub resume_token: Vec<u8>,
    /// The target is in sync with the backend as of the event.
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn is_empty(&self) -> bool {
        self.added_documents.is_empty() && self.modified_documents.is_empty() && self.removed_documents.is_empty()
    }
}

/// Consistent snapshot aggregated from the watch stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match; their cached results
    /// are discarded and the targets are listened to again from scratch.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: DocumentMap,
    /// Updated documents that only belong to limbo resolution targets.
    pub resolved_limbo_documents: DocumentKeySet,
}
