//! Background work: feed mirroring and the refresh schedule.

pub mod scheduler;
pub mod sync;

pub use scheduler::Scheduler;
pub use sync::{FeedSync, SyncError, SyncResult};
