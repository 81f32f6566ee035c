//! Queue partitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three named partitions of the event store.
///
/// Legal transitions:
/// - Pending -> Processing (claim)
/// - Processing -> Pending (retry, orphan sweep)
/// - Processing -> Failed (exhausted / permanent error)
/// - Processing -> removed (delivered)
/// - Failed -> Pending (manual reset)
/// - Pending -> Failed (sweep of over-limit records)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Waiting for a delivery attempt (possibly not yet eligible).
    Pending,

    /// Claimed by the worker for an in-flight attempt.
    Processing,

    /// Gave up. Stays here until someone resets it.
    Failed,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Pending, Partition::Processing, Partition::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            Partition::Pending => "pending",
            Partition::Processing => "processing",
            Partition::Failed => "failed",
        }
    }

    /// Name of the partition's log file inside the data directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Partition::Pending => "pending.jsonl",
            Partition::Processing => "processing.jsonl",
            Partition::Failed => "failed.jsonl",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
