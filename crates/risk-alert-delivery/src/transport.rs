use std::time::Duration;

use serde_json::Value;

/// Status, optional `Retry-After` seconds and body text of one webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<f64>,
    pub body: String,
}

impl TransportResponse {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: String::new(),
        }
    }
}

/// The request never produced an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

pub trait WebhookTransport {
    #[allow(clippy::missing_errors_doc)]
    fn post_json(&self, url: &str, body: &Value) -> Result<TransportResponse, TransportError>;
}

/// Blocking webhook transport on a shared `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl WebhookTransport for UreqTransport {
    fn post_json(&self, url: &str, body: &Value) -> Result<TransportResponse, TransportError> {
        let request = self
            .agent
            .request("POST", url)
            .set("content-type", "application/json");

        let response = match request.send_json(body) {
            Ok(response) | Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(err)) => return Err(TransportError(err.to_string())),
        };

        let status = response.status();
        let retry_after = response.header("retry-after").and_then(parse_retry_after);
        let body = response.into_string().unwrap_or_default();
        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Parses a `Retry-After` value given in (possibly fractional) seconds.
/// HTTP-date values are not honoured.
#[must_use]
pub fn parse_retry_after(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
}

/// Blocks the calling thread between retry attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
