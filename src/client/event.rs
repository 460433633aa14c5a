use tokio::sync::oneshot;

use super::DocumentSnapshot;
use super::PendingWrite;
use super::QuerySnapshot;
use crate::core::ListenerId;
use crate::core::Query;
use crate::core::QueryListener;
use crate::model::DocumentKey;
use crate::model::Mutation;
use crate::Result;

pub(crate) type Responder<T> = oneshot::Sender<Result<T>>;

/// Requests from [`SyncClient`](super::SyncClient) handles to the worker.
#[derive(Debug)]
pub(crate) enum ClientEvent {
    Write {
        mutations: Vec<Mutation>,
        responder: Responder<PendingWrite>,
    },
    GetDocument {
        key: DocumentKey,
        responder: Responder<DocumentSnapshot>,
    },
    GetQuery {
        query: Query,
        responder: Responder<QuerySnapshot>,
    },
    Listen {
        listener: QueryListener,
        responder: Responder<()>,
    },
    /// Sent when a listener registration is dropped; nobody waits for it.
    Unlisten {
        query: Query,
        listener_id: ListenerId,
    },
    WaitForPendingWrites {
        responder: Responder<()>,
    },
    EnableNetwork {
        responder: Responder<()>,
    },
    DisableNetwork {
        responder: Responder<()>,
    },
    Shutdown {
        responder: Responder<()>,
    },
}
