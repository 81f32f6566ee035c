//! HTTP implementation of the backend contract.
//!
//! Status handling:
//! - 2xx and 409 (already exists) are success
//! - everything else becomes a `DeliveryError` via `DeliveryError::from_status`
//! - 429 carries the `Retry-After` hint (seconds or HTTP date)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Serialize;
use tracing::{Instrument, debug, info_span};

use crate::domain::DeliveryError;
use crate::ports::{Backend, MessageBody, SessionBody};

/// Error bodies are kept for diagnosis, but not whole.
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpBackend {
    /// `base_url` is e.g. `http://localhost:8000/api/v1`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hookline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryError::network(format!("failed to build HTTP client: {e}")))?;

        let base_url: String = base_url.into();
        let base_url = Url::parse(&base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| DeliveryError::malformed(format!("invalid base URL: {base_url}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// `segments` are appended to the base path, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post<B: Serialize + ?Sized>(&self, segments: &[&str], body: &B) -> Result<(), DeliveryError> {
        let url = self.url(segments);
        let span = info_span!("backend_post", url = %url);

        async move {
            let response = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| self.transport_error(e))?;

            let status = response.status();
            if status.is_success() || status == StatusCode::CONFLICT {
                debug!(status = status.as_u16(), "delivered");
                return Ok(());
            }

            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            debug!(status = status.as_u16(), "backend rejected request");

            Err(DeliveryError::from_status(status.as_u16(), body, retry_after))
        }
        .instrument(span)
        .await
    }

    fn transport_error(&self, error: reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::timeout(self.timeout)
        } else {
            DeliveryError::network(error.to_string())
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_session(&self, body: &SessionBody) -> Result<(), DeliveryError> {
        self.post(&["sessions"], body).await
    }

    async fn append_message(&self, session_id: &str, body: &MessageBody) -> Result<(), DeliveryError> {
        self.post(&["sessions", session_id, "messages"], body).await
    }
}

/// `Retry-After` as either delta-seconds or an HTTP date.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}
