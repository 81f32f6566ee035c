//! In-memory view of all three partitions and the transitions between them.
//!
//! Everything here is pure: the file store loads a snapshot, applies one of
//! these methods and commits the result.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventRecord, Partition};
use crate::domain::{EventId, Resolution};
use crate::error::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub pending: Vec<EventRecord>,
    pub processing: Vec<EventRecord>,
    pub failed: Vec<EventRecord>,
}

impl Snapshot {
    pub fn partition(&self, partition: Partition) -> &[EventRecord] {
        match partition {
            Partition::Pending => &self.pending,
            Partition::Processing => &self.processing,
            Partition::Failed => &self.failed,
        }
    }

    /// Drop later copies of any id so each id lives in exactly one place.
    /// Processing wins over pending and failed, pending over failed.
    pub(crate) fn dedup(&mut self) -> usize {
        let mut seen = HashSet::new();
        let mut dropped = 0;
        for list in [&mut self.processing, &mut self.pending, &mut self.failed] {
            let before = list.len();
            list.retain(|r| seen.insert(r.id));
            dropped += before - list.len();
        }
        dropped
    }

    /// pending -> processing for eligible records, oldest first.
    pub fn claim(&mut self, now: DateTime<Utc>, limit: Option<usize>) -> Vec<EventRecord> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut claimed = Vec::new();
        let mut remaining = Vec::with_capacity(self.pending.len());

        for mut record in self.pending.drain(..) {
            if claimed.len() < limit && record.is_eligible(now) {
                record.mark_claimed(now);
                claimed.push(record);
            } else {
                remaining.push(record);
            }
        }

        self.pending = remaining;
        self.processing.extend(claimed.iter().cloned());
        claimed
    }

    /// Apply the outcome of one attempt to a claimed record.
    pub fn resolve(
        &mut self,
        id: EventId,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let index = self
            .processing
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotClaimed(id))?;
        let mut record = self.processing.remove(index);

        match resolution {
            Resolution::Delivered => {}
            Resolution::Retry { delay, error } => {
                record.mark_retry(now, *delay, error.clone());
                self.pending.push(record);
            }
            Resolution::Failed { error } => {
                record.mark_failed(error.clone());
                self.failed.push(record);
            }
        }
        Ok(())
    }

    /// processing -> pending for claims older than `timeout`.
    pub fn sweep_orphans(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<EventId> {
        let (orphans, live): (Vec<_>, Vec<_>) = self
            .processing
            .drain(..)
            .partition(|r| r.is_orphaned(now, timeout));
        self.processing = live;

        let ids = orphans.iter().map(|r| r.id).collect();
        // back to the front: they were claimed before anything still pending
        let mut released: Vec<_> = orphans
            .into_iter()
            .map(|mut r| {
                r.mark_released();
                r
            })
            .collect();
        released.append(&mut self.pending);
        self.pending = released;
        ids
    }

    /// pending -> failed for records already beyond `max_retry_count`.
    pub fn fail_exhausted(&mut self, max_retry_count: u32) -> Vec<EventId> {
        let (over, ok): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|r| r.attempt_count > max_retry_count);
        self.pending = ok;

        let ids = over.iter().map(|r| r.id).collect();
        self.failed.extend(over.into_iter().map(|mut r| {
            r.mark_over_limit(max_retry_count);
            r
        }));
        ids
    }

    /// failed -> pending with a fresh retry budget. `None` resets everything;
    /// ids that are not in failed are ignored.
    pub fn reset_failed(&mut self, ids: Option<&[EventId]>, now: DateTime<Utc>) -> Vec<EventId> {
        let wanted: Option<HashSet<EventId>> = ids.map(|ids| ids.iter().copied().collect());
        let (reset, kept): (Vec<_>, Vec<_>) = self.failed.drain(..).partition(|r| {
            // quarantined lines cannot be delivered, resetting them only loops
            r.kind.is_deliverable()
                && wanted.as_ref().is_none_or(|wanted| wanted.contains(&r.id))
        });
        self.failed = kept;

        let ids = reset.iter().map(|r| r.id).collect();
        self.pending.extend(reset.into_iter().map(|mut r| {
            r.mark_reset(now);
            r
        }));
        ids
    }

    /// Earliest `next_eligible_at` among pending records.
    pub fn next_eligible_at(&self) -> Option<DateTime<Utc>> {
        self.pending.iter().map(|r| r.next_eligible_at).min()
    }
}
