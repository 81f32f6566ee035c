//! Resolution model: how a claimed record leaves processing.
//!
//! The worker produces exactly one `Resolution` per claimed record; the store
//! applies it as a single partition transition.

use std::time::Duration;

/// Result of one delivery attempt, as applied to the store.
///
/// - `Delivered`: processing → removed
/// - `Retry`: processing → pending, eligible again after `delay`
/// - `Failed`: processing → failed (exhausted or permanently rejected)
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Delivered,

    Retry { delay: Duration, error: String },

    Failed { error: String },
}

impl Resolution {
    pub fn retry(delay: Duration, error: impl Into<String>) -> Self {
        Self::Retry {
            delay,
            error: error.into(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Delivered => "delivered",
            Resolution::Retry { .. } => "retry",
            Resolution::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_keep_error_text() {
        let r = Resolution::retry(Duration::from_secs(4), "HTTP 503");
        assert_eq!(r.label(), "retry");
        assert!(matches!(r, Resolution::Retry { ref error, .. } if error == "HTTP 503"));

        let f = Resolution::failed("HTTP 400");
        assert_eq!(f.label(), "failed");
        assert_eq!(Resolution::Delivered.label(), "delivered");
    }
}
