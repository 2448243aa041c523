//! Offline write queue and the scheduler that drains it.
//!
//! Mutating requests that fail for lack of network are persisted here and
//! replayed, oldest first, on the next connectivity-restored signal.

mod store;
mod sync;

pub use store::{DeadLetter, FailureOutcome, QueueItem, RawQueueItem, WriteQueue};
pub use sync::{DrainReport, SyncScheduler};
