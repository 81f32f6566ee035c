//! Domain model (ids, kinds, delivery errors, decisions, resolutions).

pub mod decision;
pub mod errors;
pub mod ids;
pub mod kind;
pub mod outcome;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{DeliveryError, ErrorKind};
pub use ids::{EventId, ParseEventIdError};
pub use kind::{EventKind, ParseEventKindError};
pub use outcome::Resolution;
