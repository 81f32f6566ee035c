//! Queue module: records, partitions, retry policy and the file-backed store.

mod file;
mod journal;
mod jsonl;
pub mod lock;
pub(crate) mod record;
mod retry;
mod snapshot;
mod state;

pub use file::{FileEventStore, STORE_LOCK_STALE_AFTER, STORE_LOCK_WAIT};
pub use lock::{LockFile, LockGuard, LockHolder};
pub use record::EventRecord;
pub use retry::RetryPolicy;
pub use snapshot::Snapshot;
pub use state::Partition;
