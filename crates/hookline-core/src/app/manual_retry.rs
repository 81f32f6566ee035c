//! ManualRetry - failed パーティションの手動復旧
//!
//! failed → pending（attempt_count = 0）。何度実行しても結果は同じ。

use std::sync::Arc;

use tracing::info;

use crate::domain::EventId;
use crate::error::StoreError;
use crate::ports::EventStore;
use crate::queue::EventRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrySelection {
    All,
    Ids(Vec<EventId>),
}

pub struct ManualRetry {
    store: Arc<dyn EventStore>,
}

impl ManualRetry {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<EventRecord>, StoreError> {
        self.store.list_failed()
    }

    /// Move the selected failed records back to pending. Returns the ids that
    /// actually moved; ids not in failed are ignored.
    pub fn reset(&self, selection: &RetrySelection) -> Result<Vec<EventId>, StoreError> {
        let reset = match selection {
            RetrySelection::All => self.store.reset_failed(None)?,
            RetrySelection::Ids(ids) => self.store.reset_failed(Some(ids.as_slice()))?,
        };
        info!(count = reset.len(), "reset failed records to pending");
        Ok(reset)
    }
}

/// One line per failed record, for humans.
pub fn describe(record: &EventRecord) -> String {
    format!(
        "{}\t{}\t{}\tattempts={}\t{}",
        record.id,
        record.kind,
        record.session_id,
        record.attempt_count,
        record.last_error.as_deref().unwrap_or("-"),
    )
}
