use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use super::ListenRequest;
use super::WatchChange;
use super::WriteRequest;
use super::WriteResponse;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::Code;
use crate::Error;
use crate::Result;
use crate::StatusError;

/// Request metadata such as the authorization header.
pub type Headers = BTreeMap<String, String>;

/// Both halves of an open bidirectional stream.
///
/// Messages arrive in order on `incoming`. An `Err` item closes the stream
/// with that status; the channel closing without an error means the
/// backend ended the stream. Dropping `outgoing` ends the client side.
#[derive(Debug)]
pub struct DuplexStream<Req, Resp> {
    pub outgoing: mpsc::UnboundedSender<Req>,
    pub incoming: mpsc::Receiver<std::result::Result<Resp, StatusError>>,
}

/// Wire transport to the document backend.
///
/// Implementations own framing, encoding and connection management. The
/// sync engine only needs in-order delivery and distinct close/error
/// signals.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_listen_stream(
        &self,
        headers: Headers,
    ) -> Result<DuplexStream<ListenRequest, WatchChange>>;

    async fn open_write_stream(
        &self,
        headers: Headers,
    ) -> Result<DuplexStream<WriteRequest, WriteResponse>>;

    /// Unary read of the given documents. Missing documents come back as
    /// `NoDocument`.
    async fn batch_get_documents(
        &self,
        keys: Vec<DocumentKey>,
        headers: Headers,
    ) -> Result<Vec<Document>>;
}

/// Transport for clients that run without a backend. Every call fails with
/// `Unavailable`, which keeps the client offline.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnreachableConnection;

#[async_trait]
impl Connection for UnreachableConnection {
    async fn open_listen_stream(
        &self,
        _headers: Headers,
    ) -> Result<DuplexStream<ListenRequest, WatchChange>> {
        Err(unreachable_backend())
    }

    async fn open_write_stream(
        &self,
        _headers: Headers,
    ) -> Result<DuplexStream<WriteRequest, WriteResponse>> {
        Err(unreachable_backend())
    }

    async fn batch_get_documents(
        &self,
        _keys: Vec<DocumentKey>,
        _headers: Headers,
    ) -> Result<Vec<Document>> {
        Err(unreachable_backend())
    }
}

fn unreachable_backend() -> Error {
    Error::Status(StatusError::new(Code::Unavailable, "no backend configured"))
}
