use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What kind of host lifecycle occurrence a record describes.
///
/// The kind decides which backend call the dispatcher makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    AssistantMessage,
    ToolAttempt,
    BashResult,

    /// Explicit session creation, sent when the host starts a session.
    SessionStart,

    /// Record recovered from an unreadable log line. Never deliverable.
    Unknown,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::UserMessage,
        EventKind::AssistantMessage,
        EventKind::ToolAttempt,
        EventKind::BashResult,
        EventKind::SessionStart,
        EventKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::UserMessage => "user_message",
            EventKind::AssistantMessage => "assistant_message",
            EventKind::ToolAttempt => "tool_attempt",
            EventKind::BashResult => "bash_result",
            EventKind::SessionStart => "session_start",
            EventKind::Unknown => "unknown",
        }
    }

    /// Does this kind append a message to a session?
    pub fn is_message(self) -> bool {
        matches!(
            self,
            EventKind::UserMessage
                | EventKind::AssistantMessage
                | EventKind::ToolAttempt
                | EventKind::BashResult
        )
    }

    pub fn is_deliverable(self) -> bool {
        self != EventKind::Unknown
    }

    /// Message role on the backend. `None` for non-message kinds.
    pub fn role(self) -> Option<&'static str> {
        match self {
            EventKind::UserMessage => Some("user"),
            EventKind::AssistantMessage | EventKind::ToolAttempt | EventKind::BashResult => {
                Some("assistant")
            }
            EventKind::SessionStart | EventKind::Unknown => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct ParseEventKindError(String);

impl FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseEventKindError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(EventKind::UserMessage, Some("user"))]
    #[case(EventKind::AssistantMessage, Some("assistant"))]
    #[case(EventKind::ToolAttempt, Some("assistant"))]
    #[case(EventKind::BashResult, Some("assistant"))]
    #[case(EventKind::SessionStart, None)]
    #[case(EventKind::Unknown, None)]
    fn role_mapping(#[case] kind: EventKind, #[case] role: Option<&str>) {
        assert_eq!(kind.role(), role);
        assert_eq!(kind.is_message(), role.is_some());
    }

    #[test]
    fn serde_name_matches_as_str() {
        for kind in EventKind::ALL {
            let s = serde_json::to_string(&kind).unwrap();
            assert_eq!(s, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn parse_rejects_unknown_names() {
        assert!("tool_call".parse::<EventKind>().is_err());
    }
}
