//! Dispatch - レコードの kind から backend 呼び出しへの変換
//!
//! - message 系: `append_message`。404 ならセッションを作って 1 回だけ再送
//! - session_start: `create_session`
//! - unknown: 配送不可（permanent）
//!
//! 各呼び出しは `request_timeout` で打ち切る。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::domain::{DeliveryError, EventKind};
use crate::ports::{Backend, MessageBody, MessageMetadata, SessionBody};
use crate::queue::EventRecord;

/// Longest `content` the backend accepts, in characters.
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Room kept for the truncation notice.
const TRUNCATION_NOTICE_RESERVE: usize = 100;

const DEFAULT_PROJECT_NAME: &str = "Unknown Project";

pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, request_timeout: Duration) -> Self {
        Self {
            backend,
            request_timeout,
        }
    }

    /// Deliver one record. `Ok` means the backend has it.
    pub async fn dispatch(&self, record: &EventRecord) -> Result<(), DeliveryError> {
        if record.session_id.trim().is_empty() {
            return Err(DeliveryError::malformed("empty session_id"));
        }

        match record.kind {
            EventKind::SessionStart => self.create_session(&session_body(record)).await,
            kind if kind.is_message() => self.append_message(record).await,
            kind => Err(DeliveryError::malformed(format!(
                "{kind} records cannot be delivered"
            ))),
        }
    }

    async fn append_message(&self, record: &EventRecord) -> Result<(), DeliveryError> {
        let body = message_body(record)?;

        match self.send_message(&record.session_id, &body).await {
            Err(DeliveryError::Client {
                status_code: 404, ..
            }) => {
                info!(
                    event_id = %record.id,
                    session_id = %record.session_id,
                    "session missing on backend, creating it"
                );
                self.create_session(&session_body(record)).await?;
                self.send_message(&record.session_id, &body).await
            }
            other => other,
        }
    }

    async fn send_message(&self, session_id: &str, body: &MessageBody) -> Result<(), DeliveryError> {
        self.bounded(self.backend.append_message(session_id, body))
            .await
    }

    async fn create_session(&self, body: &SessionBody) -> Result<(), DeliveryError> {
        self.bounded(self.backend.create_session(body)).await
    }

    async fn bounded(
        &self,
        call: impl Future<Output = Result<(), DeliveryError>>,
    ) -> Result<(), DeliveryError> {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| DeliveryError::timeout(self.request_timeout))?
    }
}

fn str_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

fn message_body(record: &EventRecord) -> Result<MessageBody, DeliveryError> {
    let role = record
        .kind
        .role()
        .ok_or_else(|| DeliveryError::malformed(format!("{} has no message role", record.kind)))?;

    let content = record
        .payload
        .get("content")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| DeliveryError::malformed("payload.content missing or empty"))?;

    Ok(MessageBody {
        role,
        content: truncate_content(content, MAX_CONTENT_CHARS),
        metadata: MessageMetadata {
            tool_calls: record
                .payload
                .get("tool_calls")
                .filter(|v| !v.is_null())
                .cloned(),
            project_name: str_field(&record.payload, "project_name")
                .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string()),
            cwd: str_field(&record.payload, "cwd").unwrap_or_default(),
        },
    })
}

fn session_body(record: &EventRecord) -> SessionBody {
    SessionBody {
        claude_session_id: record.session_id.clone(),
        project_name: str_field(&record.payload, "project_name")
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string()),
        cwd: str_field(&record.payload, "cwd").unwrap_or_default(),
        git_branch: str_field(&record.payload, "git_branch"),
        git_status: str_field(&record.payload, "git_status"),
    }
}

/// Cut `content` to at most `max_chars` characters, saying so at the end.
pub fn truncate_content(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_string();
    }

    let keep = max_chars.saturating_sub(TRUNCATION_NOTICE_RESERVE);
    let mut out: String = content.chars().take(keep).collect();
    out.push_str(&format!(
        "\n\n[... Content truncated. Original length: {total} chars, showing first {keep} chars ...]"
    ));
    out
}
