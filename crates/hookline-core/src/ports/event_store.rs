//! EventStore port - 永続キュー
//!
//! pending / processing / failed の 3 パーティションを持つ。
//! 実装はブロッキングなファイル I/O なので、async 側からは
//! `spawn_blocking` 経由で呼ぶこと。
//!
//! # 不変条件
//! - レコードは常にちょうど 1 つのパーティションに属する
//! - `append` は戻った時点で durable
//! - どの mutation も失敗時にパーティション所属を壊さない

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{EventId, Resolution};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::queue::EventRecord;

pub trait EventStore: Send + Sync {
    /// Add a record to pending. Durable before returning.
    fn append(&self, record: &EventRecord) -> Result<(), StoreError>;

    /// Move eligible pending records into processing and return them.
    /// `None` claims every eligible record.
    fn claim_pending(&self, limit: Option<usize>) -> Result<Vec<EventRecord>, StoreError>;

    /// Apply the outcome of an attempt to a record in processing.
    fn resolve(&self, id: EventId, resolution: &Resolution) -> Result<(), StoreError>;

    /// processing -> pending for claims older than `processing_timeout`.
    fn sweep_orphans(&self, processing_timeout: Duration) -> Result<Vec<EventId>, StoreError>;

    /// pending -> failed for records already over `max_retry_count`.
    fn fail_exhausted(&self, max_retry_count: u32) -> Result<Vec<EventId>, StoreError>;

    fn list_failed(&self) -> Result<Vec<EventRecord>, StoreError>;

    /// failed -> pending with `attempt_count = 0`. `None` resets all.
    fn reset_failed(&self, ids: Option<&[EventId]>) -> Result<Vec<EventId>, StoreError>;

    fn counts(&self) -> Result<QueueCounts, StoreError>;

    /// Earliest time any pending record becomes eligible.
    fn next_eligible_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}
