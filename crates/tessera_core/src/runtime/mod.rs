//! Jobs, futures and the worker pools they run on.

pub mod future;
pub mod job;
pub mod mutex;
pub mod parallel;
pub mod scheduler;
