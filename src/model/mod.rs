//! Document data model: paths, values, documents and mutations.
mod document;
mod mutation;
mod mutation_batch;
mod path;
mod timestamp;
mod value;
pub use document::*;
pub use mutation::*;
pub use mutation_batch::*;
pub use path::*;
pub use timestamp::*;
pub use value::*;

#[cfg(test)]
mod model_test;

/// Identifier of a mutation batch, strictly increasing per user.
pub type BatchId = i64;

/// Identifier of a watch target. Even ids belong to query targets, odd ids
/// to limbo resolutions.
pub type TargetId = i32;

/// Logical clock used to order target usage.
pub type ListenSequenceNumber = i64;
