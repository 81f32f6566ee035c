//! Decision model: what to do with a record after a failed attempt.
//!
//! This module defines the Decision type (retry or give up) and the Decider
//! trait (how to get there from the attempt history and the error).

use std::time::Duration;

use super::{DeliveryError, ErrorKind, Resolution};
use crate::queue::RetryPolicy;

/// The next action for a record whose delivery just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the record back in pending, eligible after `delay`.
    Retry { delay: Duration, reason: String },

    /// Route the record to failed.
    Exhausted { reason: String },
}

impl Decision {
    /// Convert into the store transition for this decision.
    pub fn into_resolution(self) -> Resolution {
        match self {
            Decision::Retry { delay, reason } => Resolution::Retry { delay, error: reason },
            Decision::Exhausted { reason } => Resolution::Failed { error: reason },
        }
    }
}

/// Decides the next action for a failed delivery.
///
/// Deciders are pure: given the attempt history and the error they return the
/// next action without side effects. The store applies it.
pub trait Decider: Send + Sync {
    /// # Arguments
    /// * `attempt_count` - failed attempts recorded before this one
    /// * `error` - the failure of the current attempt
    fn decide(&self, attempt_count: u32, error: &DeliveryError) -> Decision;
}

/// Exponential backoff with a retry budget.
///
/// - Permanent errors are exhausted immediately
/// - Exhausted when `attempt_count + 1 > max_retry_count`
/// - Otherwise retry after `RetryPolicy::next_delay`, or the server's
///   `Retry-After` hint when one was given (capped at `max_delay`)
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, attempt_count: u32, error: &DeliveryError) -> Decision {
        if error.kind() == ErrorKind::Permanent {
            return Decision::Exhausted {
                reason: format!("permanent failure: {error}"),
            };
        }

        let max = self.retry_policy.max_retry_count;
        if self.retry_policy.is_exhausted_after(attempt_count) {
            return Decision::Exhausted {
                reason: format!("max retries reached ({}/{max}): {error}", attempt_count + 1),
            };
        }

        let delay = match error.retry_after() {
            Some(hint) => hint.min(self.retry_policy.max_delay),
            None => self.retry_policy.next_delay(attempt_count),
        };

        Decision::Retry {
            delay,
            reason: format!("attempt {}/{max} failed: {error}", attempt_count + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decider(max_retry_count: u32) -> DefaultDecider {
        DefaultDecider::new(
            RetryPolicy {
                max_retry_count,
                ..Default::default()
            }
            .without_jitter(),
        )
    }

    #[test]
    fn transient_error_retries_with_backoff() {
        let d = decider(10);
        let decision = d.decide(2, &DeliveryError::server(503, "unavailable"));

        match decision {
            Decision::Retry { delay, reason } => {
                assert_eq!(delay, Duration::from_secs(8));
                assert!(reason.contains("attempt 3/10"));
                assert!(reason.contains("503"));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn permanent_error_is_exhausted_immediately() {
        let d = decider(10);
        let decision = d.decide(0, &DeliveryError::client(400, "bad request"));
        assert!(matches!(decision, Decision::Exhausted { .. }));
    }

    #[test]
    fn budget_is_enforced() {
        let d = decider(2);
        let err = DeliveryError::network("connection refused");

        assert!(matches!(d.decide(0, &err), Decision::Retry { .. }));
        assert!(matches!(d.decide(1, &err), Decision::Retry { .. }));
        assert!(matches!(d.decide(2, &err), Decision::Exhausted { .. }));
    }

    #[test]
    fn retry_after_hint_overrides_backoff_but_respects_cap() {
        let d = decider(10);

        let hinted = DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            d.decide(0, &hinted).into_resolution(),
            Resolution::Retry {
                delay: Duration::from_secs(30),
                error: "attempt 1/10 failed: rate limited: HTTP 429".to_string(),
            }
        );

        let huge = DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(3600)),
        };
        match d.decide(0, &huge) {
            Decision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(300)),
            other => panic!("expected retry, got {other:?}"),
        }
    }
}
