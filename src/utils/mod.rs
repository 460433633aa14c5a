pub(crate) mod async_task;
pub(crate) mod backoff;
pub mod convert;
pub(crate) mod time;
pub(crate) mod timer;
