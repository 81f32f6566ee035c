//! RecoverySweep - 孤児レコードの回収
//!
//! # フロー
//! 1. `sweep_orphans(processing_timeout)`: 期限切れの claim を pending に戻す
//!    （attempt_count はそのまま）
//! 2. `fail_exhausted(max_retry_count)`: 上限を超えた pending を failed へ
//!
//! ワーカー起動時と `sweep_interval` ごとに実行される。

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::on_store;
use crate::domain::EventId;
use crate::error::StoreError;
use crate::ports::EventStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// processing -> pending
    pub recovered: Vec<EventId>,

    /// pending -> failed (over the retry limit)
    pub exhausted: Vec<EventId>,
}

pub struct RecoverySweep {
    store: Arc<dyn EventStore>,
    processing_timeout: Duration,
    max_retry_count: u32,
}

impl RecoverySweep {
    pub fn new(store: Arc<dyn EventStore>, processing_timeout: Duration, max_retry_count: u32) -> Self {
        Self {
            store,
            processing_timeout,
            max_retry_count,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let timeout = self.processing_timeout;
        let recovered = on_store(&self.store, move |s| s.sweep_orphans(timeout)).await?;

        let max = self.max_retry_count;
        let exhausted = on_store(&self.store, move |s| s.fail_exhausted(max)).await?;

        if !recovered.is_empty() {
            info!(count = recovered.len(), ids = ?recovered, "recovered orphaned records");
        }
        if !exhausted.is_empty() {
            warn!(count = exhausted.len(), ids = ?exhausted, "moved over-limit records to failed");
        }
        Ok(SweepReport {
            recovered,
            exhausted,
        })
    }

    /// Release every claim regardless of age.
    ///
    /// Only valid for the holder of the worker lock: with a single worker,
    /// every claim in processing is its own.
    pub async fn release_all(&self) -> Result<Vec<EventId>, StoreError> {
        on_store(&self.store, |s| s.sweep_orphans(Duration::ZERO)).await
    }
}
