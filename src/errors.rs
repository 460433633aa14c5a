//! Document Sync Error Hierarchy
//!
//! Errors are grouped by the layer that raises them. Every error maps onto a
//! backend status [`Code`], which drives the retry policy of the sync engine:
//! retryable codes are absorbed by backoff, permanent codes reach the caller.

use std::fmt;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Status reported by the backend or raised on behalf of a caller
    #[error(transparent)]
    Status(#[from] StatusError),

    /// Local persistence failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Invalid paths, field values or queries supplied by the application
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Local storage failed and the client stopped writing to it
    #[error("Primary lease lost: {0}")]
    PrimaryLeaseLost(String),

    /// The client worker has stopped
    #[error("The client has been terminated")]
    ClientTerminated,
}

impl Error {
    pub fn code(&self) -> Code {
        match self {
            Error::Status(status) => status.code,
            Error::Storage(StorageError::DataCorruption { .. }) => Code::DataLoss,
            Error::Storage(_) => Code::Unavailable,
            Error::Model(_) => Code::InvalidArgument,
            Error::Config(_) => Code::InvalidArgument,
            Error::PrimaryLeaseLost(_) => Code::FailedPrecondition,
            Error::ClientTerminated => Code::FailedPrecondition,
        }
    }

    pub(crate) fn status(
        code: Code,
        message: impl Into<String>,
    ) -> Self {
        Error::Status(StatusError::new(code, message))
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::status(Code::Internal, message)
    }
}

/// Canonical status codes shared with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Unavailable,
    DataLoss,
    Internal,
    Unauthenticated,
}

impl Code {
    /// Permanent errors are surfaced to the caller and never retried.
    pub fn is_permanent_error(self) -> bool {
        !matches!(
            self,
            Code::Cancelled
                | Code::Unknown
                | Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Internal
                | Code::Unavailable
                | Code::Unauthenticated
        )
    }

    /// Write failures are judged more strictly: an aborted commit is retried.
    pub fn is_permanent_write_error(self) -> bool {
        self.is_permanent_error() && self != Code::Aborted
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Code::Unavailable | Code::ResourceExhausted | Code::Aborted | Code::DeadlineExceeded
        )
    }
}

impl fmt::Display for Code {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid-argument",
            Code::DeadlineExceeded => "deadline-exceeded",
            Code::NotFound => "not-found",
            Code::AlreadyExists => "already-exists",
            Code::PermissionDenied => "permission-denied",
            Code::ResourceExhausted => "resource-exhausted",
            Code::FailedPrecondition => "failed-precondition",
            Code::Aborted => "aborted",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data-loss",
            Code::Internal => "internal",
            Code::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// A status code with a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct StatusError {
    pub code: Code,
    pub message: String,
}

impl StatusError {
    pub fn new(
        code: Code,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Embedded database errors
    #[error(transparent)]
    Sled(#[from] sled::Error),

    /// Serialization failures for persisted records
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    /// Disk I/O failures
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A persisted record could not be interpreted
    #[error("Data corruption detected at {location}")]
    DataCorruption { location: String },

    /// Failures reported by a custom storage backend
    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("Invalid resource path: {0}")]
    InvalidPath(String),

    #[error("Invalid document key {path}: document keys need an even number of segments")]
    InvalidDocumentKey { path: String },

    #[error("Invalid collection path {path}: collection paths need an odd number of segments")]
    InvalidCollectionPath { path: String },

    #[error("Invalid field path: {0}")]
    InvalidFieldPath(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

// ============== Conversion Implementations ============== //
impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Storage(StorageError::Sled(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Storage(StorageError::Bincode(e))
    }
}
