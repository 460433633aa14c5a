//! Helpers shared by the unit tests: document and mutation builders plus an
//! in-process backend that scripts the watch and write streams.
mod builders;
mod fake_backend;

pub use builders::*;
pub use fake_backend::*;
