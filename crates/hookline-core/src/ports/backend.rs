//! Backend port - リモート収集 API
//!
//! - `POST /sessions`: セッション作成（`claude_session_id` で冪等）
//! - `POST /sessions/{session_id}/messages`: メッセージ追加
//!
//! 成功以外はすべて `DeliveryError` として返し、分類は呼び出し側に任せる。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::domain::DeliveryError;

/// Body of `POST /sessions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionBody {
    pub claude_session_id: String,
    pub project_name: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_status: Option<String>,
}

/// Body of `POST /sessions/{session_id}/messages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageBody {
    pub role: &'static str,
    pub content: String,
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    pub project_name: String,
    pub cwd: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_session(&self, body: &SessionBody) -> Result<(), DeliveryError>;

    async fn append_message(&self, session_id: &str, body: &MessageBody) -> Result<(), DeliveryError>;
}
