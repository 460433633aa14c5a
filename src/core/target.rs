use serde::Deserialize;
use serde::Serialize;

use super::query::canonical_target_id;
use super::query::document_matches;
use super::DocumentComparator;
use super::FieldFilter;
use super::OrderBy;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::ListenSequenceNumber;
use crate::model::ResourcePath;
use crate::model::SnapshotVersion;
use crate::model::TargetId;

/// Query as registered with the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub path: ResourcePath,
    pub filters: Vec<FieldFilter>,
    /// Normalized ordering, always ending with the key.
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        filters: Vec<FieldFilter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
    ) -> Self {
        Self {
            path,
            filters,
            order_by,
            limit,
        }
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.filters.is_empty()
    }

    pub fn matches(
        &self,
        doc: &Document,
    ) -> bool {
        document_matches(&self.path, &self.filters, &self.order_by, doc)
    }

    pub fn comparator(&self) -> DocumentComparator {
        DocumentComparator::new(self.order_by.clone())
    }

    pub fn canonical_id(&self) -> String {
        canonical_target_id(&self.path, &self.filters, &self.order_by, self.limit)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPurpose {
    /// Regular query listen.
    Listen,
    /// Re-listen after an existence filter mismatch without a bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after the bloom filter could not explain a mismatch.
    ExistenceFilterMismatchBloom,
    /// Single-document listen resolving a limbo document.
    LimboResolution,
}

/// Persisted state of a target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Latest snapshot version the backend reported for this target.
    pub snapshot_version: SnapshotVersion,
    /// Version at which the view last had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque cursor for resuming the listen; empty when unknown.
    pub resume_token: Vec<u8>,
    /// Number of documents expected on resume, for existence filter checks.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::MIN,
            last_limbo_free_snapshot_version: SnapshotVersion::MIN,
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(
        mut self,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// A new resume point; the expected count no longer applies.
    pub fn with_resume_token(
        mut self,
        resume_token: Vec<u8>,
        snapshot_version: SnapshotVersion,
    ) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(
        mut self,
        expected_count: i32,
    ) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(
        mut self,
        version: SnapshotVersion,
    ) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(
        mut self,
        purpose: TargetPurpose,
    ) -> Self {
        self.purpose = purpose;
        self
    }
}

/// Allocates target ids of one parity.
///
/// Query targets use even ids handed out by the local store; limbo
/// resolutions use odd ids from the sync engine, so the two never collide.
#[derive(Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache(after: TargetId) -> Self {
        Self::seeded(0, after)
    }

    pub fn for_sync_engine() -> Self {
        Self::seeded(1, 0)
    }

    fn seeded(
        parity: TargetId,
        after: TargetId,
    ) -> Self {
        let mut next_id = (after & !1) | parity;
        if next_id <= after {
            next_id += 2;
        }
        Self { next_id }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}
