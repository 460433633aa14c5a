//! Query model, views and the sync engine that ties the local and remote
//! stores together.
mod document_set;
mod event_manager;
mod query;
mod sync_engine;
mod target;
mod view;
mod view_snapshot;

pub use document_set::*;
pub use event_manager::ListenOptions;
pub(crate) use event_manager::*;
pub use query::*;
pub(crate) use sync_engine::*;
pub use target::*;
pub(crate) use view::*;
pub use view_snapshot::ChangeType;
pub(crate) use view_snapshot::DocumentChangeSet;
pub use view_snapshot::DocumentViewChange;
pub use view_snapshot::ViewSnapshot;

#[cfg(test)]
mod document_set_test;
