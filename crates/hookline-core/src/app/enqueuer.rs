//! Enqueuer - ホスト向けの capture
//!
//! 同期・即時 return。やることは 3 つだけ:
//! 1. 入力の最低限の検証
//! 2. `append`（spool への 1 回の atomic write）
//! 3. ワーカーの起動保証（失敗してもログのみ）
//!
//! backend には一切触れない。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::domain::{EventId, EventKind};
use crate::error::CaptureError;
use crate::ports::{Clock, EventStore, IdGenerator, LaunchOutcome, WorkerLauncher};
use crate::queue::EventRecord;

/// What a hook hands over on stdin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CaptureInput {
    pub session_id: String,
    #[serde(default)]
    pub payload: Value,
}

pub struct Enqueuer {
    store: Arc<dyn EventStore>,
    launcher: Arc<dyn WorkerLauncher>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl Enqueuer {
    pub fn new(
        store: Arc<dyn EventStore>,
        launcher: Arc<dyn WorkerLauncher>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            launcher,
            ids,
            clock,
        }
    }

    /// Validate, append to pending and make sure a worker will pick it up.
    pub fn capture(&self, kind: EventKind, input: CaptureInput) -> Result<EventId, CaptureError> {
        validate(kind, &input)?;

        let record = EventRecord::new(
            self.ids.generate_event_id(),
            kind,
            input.session_id,
            input.payload,
            self.clock.now(),
        );
        self.store.append(&record)?;
        debug!(event_id = %record.id, kind = %kind, "captured");

        match self.launcher.ensure_running() {
            Ok(LaunchOutcome::Spawned { pid }) => debug!(pid, "worker started"),
            Ok(LaunchOutcome::AlreadyRunning) => {}
            // the record is safe in pending; the next capture or kick retries
            Err(e) => warn!(error = %e, "could not start worker"),
        }
        Ok(record.id)
    }

    /// Host-facing variant: never fails, only logs.
    pub fn capture_or_log(&self, kind: EventKind, input: CaptureInput) -> Option<EventId> {
        match self.capture(kind, input) {
            Ok(id) => Some(id),
            Err(e) => {
                error!(kind = %kind, error = %e, "capture failed");
                None
            }
        }
    }
}

fn validate(kind: EventKind, input: &CaptureInput) -> Result<(), CaptureError> {
    if !kind.is_deliverable() {
        return Err(CaptureError::Invalid(format!("{kind} cannot be captured")));
    }
    if input.session_id.trim().is_empty() {
        return Err(CaptureError::Invalid("session_id is empty".into()));
    }
    let Some(payload) = input.payload.as_object() else {
        return Err(CaptureError::Invalid("payload must be a JSON object".into()));
    };
    if kind.is_message() {
        let has_content = payload
            .get("content")
            .and_then(Value::as_str)
            .is_some_and(|c| !c.is_empty());
        if !has_content {
            return Err(CaptureError::Invalid(format!(
                "{kind} needs a non-empty payload.content"
            )));
        }
    }
    Ok(())
}
