//! Domain identifiers (strongly-typed IDs).
//!
//! Event records are keyed by a ULID:
//! - **sortable by time**: the timestamp is the high 48 bits, so ids sort in
//!   creation order (the pending spool relies on this for FIFO)
//! - **generated without coordination**: capture runs in many short-lived host
//!   processes at once
//! - 128-bit, same size as a UUID

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

const PREFIX: &str = "evt-";

/// Identifier of an event record.
///
/// Serialized as the bare ULID string; displayed with an `evt-` prefix.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl EventId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// File name used for this record in the pending spool.
    pub fn spool_file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl From<Ulid> for EventId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX, self.0)
    }
}

/// Error returned when an id string is neither `evt-<ulid>` nor a bare ULID.
#[derive(Debug, thiserror::Error)]
#[error("invalid event id: {0}")]
pub struct ParseEventIdError(String);

impl FromStr for EventId {
    type Err = ParseEventIdError;

    /// Accepts both the displayed form (`evt-01H...`) and the bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(PREFIX).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|_| ParseEventIdError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_prefix() {
        let ulid = Ulid::new();
        let id = EventId::from_ulid(ulid);
        assert_eq!(id.as_ulid(), ulid);
        assert!(id.to_string().starts_with("evt-"));
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = EventId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = EventId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id3 = EventId::from_ulid(Ulid::new());

        assert!(id1 < id2);
        assert!(id2 < id3);
    }

    #[test]
    fn serializes_as_bare_ulid() {
        let ulid = Ulid::new();
        let id = EventId::from_ulid(ulid);

        let serialized = serde_json::to_string(&id).unwrap();
        assert_eq!(serialized, format!("\"{ulid}\""));

        let back: EventId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parses_prefixed_and_bare_forms() {
        let id = EventId::from_ulid(Ulid::new());

        let from_display: EventId = id.to_string().parse().unwrap();
        let from_bare: EventId = id.as_ulid().to_string().parse().unwrap();

        assert_eq!(from_display, id);
        assert_eq!(from_bare, id);
        assert!("evt-not-a-ulid".parse::<EventId>().is_err());
    }
}
