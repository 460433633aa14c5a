//! Local-first document cache and sync engine.
//!
//! Writes apply to a durable local mutation queue first and show up in
//! every affected query right away; a write stream sends them to the
//! backend in order. A watch stream keeps the cached documents of every
//! listened query consistent with the backend, and documents the backend
//! no longer vouches for are resolved through limbo listens.
//!
//! Start with [`SyncClient::builder`].
mod client;
mod config;
mod constants;
mod core;
mod errors;
mod local;
mod metrics;
mod model;
mod network;
mod storage;
pub mod utils;

pub use client::*;
pub use config::*;
pub use constants::AUTHORIZATION_HEADER;
pub use constants::BATCH_GET_DOCUMENTS_ENDPOINT;
pub use constants::CLIENT_ID_HEADER;
pub use constants::KEY_FIELD_NAME;
pub use core::*;
pub use errors::*;
pub use local::FieldIndex;
pub use metrics::*;
pub use model::*;
pub use network::*;
pub use storage::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
