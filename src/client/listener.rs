use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::trace;

use super::ClientEvent;
use super::QuerySnapshot;
use crate::core::ListenerId;
use crate::core::Query;
use crate::core::ViewSnapshot;
use crate::Result;

/// Unregisters the listener from the worker when dropped.
#[derive(Debug)]
struct UnlistenGuard {
    query: Query,
    listener_id: ListenerId,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl Drop for UnlistenGuard {
    fn drop(&mut self) {
        trace!("[ListenerRegistration] removing listener {}", self.listener_id);
        // The worker may already be gone after shutdown.
        let _ = self.event_tx.send(ClientEvent::Unlisten {
            query: self.query.clone(),
            listener_id: self.listener_id,
        });
    }
}

/// Handle of an active query listen.
///
/// Snapshots and the terminal error arrive in order. Dropping the handle, or
/// calling [`remove`](Self::remove), stops the listen.
#[derive(Debug)]
pub struct ListenerRegistration {
    receiver: mpsc::UnboundedReceiver<Result<ViewSnapshot>>,
    guard: UnlistenGuard,
}

impl ListenerRegistration {
    pub(crate) fn new(
        query: Query,
        listener_id: ListenerId,
        receiver: mpsc::UnboundedReceiver<Result<ViewSnapshot>>,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            receiver,
            guard: UnlistenGuard {
                query,
                listener_id,
                event_tx,
            },
        }
    }

    pub fn query(&self) -> &Query {
        &self.guard.query
    }

    /// Next snapshot, or `None` once the client shut down.
    pub async fn next(&mut self) -> Option<Result<QuerySnapshot>> {
        self.receiver.recv().await.map(|r| r.map(QuerySnapshot::from))
    }

    /// Next snapshot if one is already queued.
    pub fn try_next(&mut self) -> Option<Result<QuerySnapshot>> {
        self.receiver.try_recv().ok().map(|r| r.map(QuerySnapshot::from))
    }

    pub fn remove(self) {}

    pub fn into_stream(self) -> ListenerStream {
        ListenerStream {
            inner: UnboundedReceiverStream::new(self.receiver),
            _guard: self.guard,
        }
    }
}

/// [`Stream`] of query snapshots; dropping it stops the listen.
#[derive(Debug)]
pub struct ListenerStream {
    inner: UnboundedReceiverStream<Result<ViewSnapshot>>,
    _guard: UnlistenGuard,
}

impl Stream for ListenerStream {
    type Item = Result<QuerySnapshot>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|item| item.map(|r| r.map(QuerySnapshot::from)))
    }
}
