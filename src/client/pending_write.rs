use tokio::sync::oneshot;

use crate::model::BatchId;
use crate::Error;
use crate::Result;

/// A write that is durable in the local store.
///
/// Listeners already see its effect. [`committed`](Self::committed)
/// resolves once the backend accepts or rejects it.
#[derive(Debug)]
pub struct PendingWrite {
    batch_id: BatchId,
    committed: oneshot::Receiver<Result<()>>,
}

impl PendingWrite {
    pub(crate) fn new(
        batch_id: BatchId,
        committed: oneshot::Receiver<Result<()>>,
    ) -> Self {
        Self { batch_id, committed }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Waits for the backend's verdict on the batch.
    ///
    /// Fails with the backend's status when the batch is rejected, and with
    /// [`Error::ClientTerminated`] when the client stops first.
    pub async fn committed(self) -> Result<()> {
        self.committed.await.map_err(|_| Error::ClientTerminated)?
    }
}
