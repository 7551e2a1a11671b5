//! Persistence layer — filesystem-backed job records.

pub mod fs_backend;
pub mod locks;
pub mod log;
pub mod traits;

pub use fs_backend::FileJobStore;
pub use locks::{KeyGuard, KeyedLocks, StoreLock};
pub use log::AppendLog;
pub use traits::JobStore;
