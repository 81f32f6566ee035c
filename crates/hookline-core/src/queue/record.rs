//! Event record: the unit of work stored in the partitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::domain::{EventId, EventKind};

/// One captured host lifecycle occurrence.
///
/// Design:
/// - This is the single source of truth for a record's retry state.
/// - The partition it lives in is not a field: the store keeps it by file.
/// - All state changes go through the `mark_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub kind: EventKind,
    pub session_id: String,

    /// Opaque structured data, interpreted only by the dispatcher.
    pub payload: Value,

    pub enqueued_at: DateTime<Utc>,

    /// Failed delivery attempts so far.
    #[serde(default)]
    pub attempt_count: u32,

    #[serde(default)]
    pub last_error: Option<String>,

    /// Set while the record sits in processing.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,

    /// The worker must not attempt delivery before this instant.
    pub next_eligible_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        id: EventId,
        kind: EventKind,
        session_id: impl Into<String>,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            session_id: session_id.into(),
            payload,
            enqueued_at: now,
            attempt_count: 0,
            last_error: None,
            claimed_at: None,
            next_eligible_at: now,
        }
    }

    /// Record standing in for an unreadable log line or spool file.
    ///
    /// It keeps the raw text so nothing is lost, and is never deliverable.
    pub fn quarantined(raw: &str, origin: &str, error: &str, now: DateTime<Utc>) -> Self {
        let id = EventId::from_ulid(Ulid::from_parts(
            now.timestamp_millis().max(0) as u64,
            rand::random(),
        ));
        let mut record = Self::new(
            id,
            EventKind::Unknown,
            "",
            serde_json::json!({ "raw": raw }),
            now,
        );
        record.last_error = Some(format!("unreadable record in {origin}: {error}"));
        record
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }

    /// Has this claim outlived `timeout`?
    pub fn is_orphaned(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.claimed_at {
            Some(claimed_at) => add_duration(claimed_at, timeout) < now,
            None => false,
        }
    }

    /// pending -> processing
    pub fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.claimed_at = Some(now);
    }

    /// processing -> pending after a failed attempt.
    pub fn mark_retry(&mut self, now: DateTime<Utc>, delay: Duration, error: String) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error);
        self.claimed_at = None;
        self.next_eligible_at = add_duration(now, delay);
    }

    /// processing -> failed.
    pub fn mark_failed(&mut self, error: String) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error);
        self.claimed_at = None;
    }

    /// processing -> pending after the owning worker went away.
    /// The interrupted attempt is not counted.
    pub fn mark_released(&mut self) {
        self.claimed_at = None;
    }

    /// pending -> failed when the record is already over the limit.
    pub fn mark_over_limit(&mut self, max_retry_count: u32) {
        let note = format!(
            "retry limit exceeded ({}/{max_retry_count})",
            self.attempt_count
        );
        self.last_error = Some(match self.last_error.take() {
            Some(previous) => format!("{note}; last error: {previous}"),
            None => note,
        });
    }

    /// failed -> pending (manual recovery). `last_error` is kept for diagnosis.
    pub fn mark_reset(&mut self, now: DateTime<Utc>) {
        self.attempt_count = 0;
        self.claimed_at = None;
        self.next_eligible_at = now;
    }
}

/// `instant + duration`, saturating at the largest representable time.
pub(crate) fn add_duration(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| instant.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn record() -> EventRecord {
        EventRecord::new(
            EventId::from_ulid(Ulid::new()),
            EventKind::UserMessage,
            "sess-1",
            serde_json::json!({"content": "hi"}),
            t0(),
        )
    }

    #[test]
    fn new_record_is_eligible_immediately() {
        let r = record();
        assert_eq!(r.attempt_count, 0);
        assert!(r.claimed_at.is_none());
        assert!(r.is_eligible(t0()));
    }

    #[test]
    fn retry_pushes_eligibility_and_counts_attempt() {
        let mut r = record();
        r.mark_claimed(t0());
        r.mark_retry(t0(), Duration::from_secs(4), "HTTP 503".into());

        assert_eq!(r.attempt_count, 1);
        assert!(r.claimed_at.is_none());
        assert!(!r.is_eligible(t0() + chrono::Duration::seconds(3)));
        assert!(r.is_eligible(t0() + chrono::Duration::seconds(4)));
    }

    #[test]
    fn release_does_not_count_attempt() {
        let mut r = record();
        r.attempt_count = 2;
        r.mark_claimed(t0());
        r.mark_released();
        assert_eq!(r.attempt_count, 2);
        assert!(r.claimed_at.is_none());
    }

    #[test]
    fn orphan_detection_uses_claim_age() {
        let mut r = record();
        assert!(!r.is_orphaned(t0(), Duration::from_secs(60)));

        r.mark_claimed(t0());
        let timeout = Duration::from_secs(300);
        assert!(!r.is_orphaned(t0() + chrono::Duration::seconds(300), timeout));
        assert!(r.is_orphaned(t0() + chrono::Duration::seconds(301), timeout));
    }

    #[test]
    fn reset_keeps_last_error() {
        let mut r = record();
        r.mark_failed("HTTP 400".into());
        r.mark_reset(t0());
        assert_eq!(r.attempt_count, 0);
        assert_eq!(r.last_error.as_deref(), Some("HTTP 400"));
    }

    #[test]
    fn quarantined_record_keeps_raw_text() {
        let r = EventRecord::quarantined("{not json", "pending.jsonl line 3", "eof", t0());
        assert_eq!(r.kind, EventKind::Unknown);
        assert_eq!(r.payload["raw"], "{not json");
        assert!(r.last_error.unwrap().contains("pending.jsonl line 3"));
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = serde_json::json!({
            "id": Ulid::new().to_string(),
            "kind": "bash_result",
            "session_id": "s",
            "payload": {"content": "ls"},
            "enqueued_at": "2025-01-01T00:00:00Z",
            "next_eligible_at": "2025-01-01T00:00:00Z"
        });
        let r: EventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(r.attempt_count, 0);
        assert!(r.last_error.is_none());
        assert!(r.claimed_at.is_none());
    }
}
