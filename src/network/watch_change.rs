//! Messages exchanged with the backend over the watch and write streams.
use serde::Deserialize;
use serde::Serialize;

use crate::core::Target;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::Mutation;
use crate::model::MutationResult;
use crate::model::SnapshotVersion;
use crate::model::TargetId;
use crate::StatusError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// A document entered, changed in or left the listed targets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// New state of the document; `None` when only membership changed.
    pub document: Option<Document>,
}

/// Bloom filter over the names of the documents that still match a target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilterData {
    pub bitmap: Vec<u8>,
    pub padding: u8,
    pub hash_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterData>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub filter: ExistenceFilter,
}

/// State change of a set of targets. An empty `target_ids` addresses every
/// target the stream knows about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub cause: Option<StatusError>,
    pub read_time: Option<SnapshotVersion>,
}

impl WatchTargetChange {
    pub fn new(
        state: WatchTargetChangeState,
        target_ids: Vec<TargetId>,
    ) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            cause: None,
            read_time: None,
        }
    }

    /// Global consistency marker: everything sent so far is consistent at
    /// `read_time`.
    pub fn global_snapshot(
        read_time: SnapshotVersion,
        resume_token: Vec<u8>,
    ) -> Self {
        Self {
            state: WatchTargetChangeState::NoChange,
            target_ids: Vec::new(),
            resume_token,
            cause: None,
            read_time: Some(read_time),
        }
    }

    pub fn with_resume_token(
        mut self,
        resume_token: Vec<u8>,
    ) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(
        mut self,
        cause: StatusError,
    ) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// One message on the watch stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
    Target(WatchTargetChange),
}

impl WatchChange {
    /// Snapshot version carried by a global target change, or `MIN`.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::Target(change) if change.target_ids.is_empty() => {
                change.read_time.unwrap_or(SnapshotVersion::MIN)
            }
            _ => SnapshotVersion::MIN,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenRequest {
    AddTarget {
        target_id: TargetId,
        target: Target,
        resume_token: Vec<u8>,
        read_time: Option<SnapshotVersion>,
        /// Documents the client believes match when resuming.
        expected_count: Option<i32>,
    },
    RemoveTarget {
        target_id: TargetId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteRequest {
    Handshake { stream_token: Vec<u8> },
    Mutations { stream_token: Vec<u8>, writes: Vec<Mutation> },
}

/// Handshake responses carry no commit version and no results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: Option<SnapshotVersion>,
    pub mutation_results: Vec<MutationResult>,
}
