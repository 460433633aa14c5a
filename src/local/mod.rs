//! Local cache layer: remote documents, the mutation queue, targets and the
//! query engine that evaluates queries over them.
mod index_manager;
mod local_documents_view;
mod local_store;
mod mutation_queue;
mod overlay;
mod query_engine;
mod remote_document_cache;
mod target_cache;

pub use index_manager::FieldIndex;
pub(crate) use index_manager::*;
pub(crate) use local_documents_view::*;
pub(crate) use local_store::*;
pub(crate) use mutation_queue::*;
pub(crate) use overlay::*;
pub(crate) use query_engine::*;
pub(crate) use remote_document_cache::*;
pub(crate) use target_cache::*;

#[cfg(test)]
mod local_documents_view_test;
#[cfg(test)]
mod mutation_queue_test;
#[cfg(test)]
mod target_cache_test;
