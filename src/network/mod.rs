//! Remote side of the sync engine: the transport and credential seams, the
//! watch and write stream protocol, and the aggregation of watch changes
//! into consistent remote events.
//!
//! The transport is abstracted behind [`Connection`]; everything else in
//! this module runs on the client's serial worker.
mod bloom_filter;
mod connection;
mod credentials;
mod online_state_tracker;
mod persistent_stream;
mod remote_event;
mod remote_store;
mod watch_change;
mod watch_change_aggregator;

pub use bloom_filter::*;
pub use connection::*;
pub use credentials::*;
pub use online_state_tracker::OnlineState;
pub(crate) use online_state_tracker::OnlineStateTracker;
pub(crate) use persistent_stream::*;
pub use remote_event::*;
pub(crate) use remote_store::*;
pub use watch_change::*;
pub(crate) use watch_change_aggregator::*;

#[cfg(test)]
mod bloom_filter_test;
#[cfg(test)]
mod online_state_tracker_test;
#[cfg(test)]
mod persistent_stream_test;
#[cfg(test)]
mod watch_change_aggregator_test;

use std::sync::Arc;

use tracing::debug;

use crate::constants::AUTHORIZATION_HEADER;
use crate::constants::BATCH_GET_DOCUMENTS_ENDPOINT;
use crate::constants::CLIENT_ID_HEADER;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::Result;

/// One-shot read of `keys` from the backend, retried per `policy`.
pub(crate) async fn batch_get_documents_with_retry(
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    client_id: String,
    keys: Vec<DocumentKey>,
    policy: BackoffPolicy,
) -> Result<Vec<Document>> {
    debug!("[Network] {} for {} documents", BATCH_GET_DOCUMENTS_ENDPOINT, keys.len());
    task_with_timeout_and_exponential_backoff(
        || {
            let connection = connection.clone();
            let credentials = credentials.clone();
            let client_id = client_id.clone();
            let keys = keys.clone();
            async move {
                let mut headers = Headers::new();
                headers.insert(CLIENT_ID_HEADER.to_string(), client_id);
                if let Some(token) = credentials.get_token(false).await? {
                    headers.insert(AUTHORIZATION_HEADER.to_string(), token.authorization_header());
                }
                connection.batch_get_documents(keys, headers).await
            }
        },
        policy,
    )
    .await
}
