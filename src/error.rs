//! Error taxonomy for the request pipeline.
//!
//! Every terminal failure maps onto a stable `errorType` string so clients
//! can discriminate rate limits from timeouts from genuine client faults,
//! plus an HTTP status and a retryability flag used to decide whether a
//! `retry-after` header accompanies the response.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Terminal request errors surfaced to clients.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request body exceeded the configured maximum size.
    #[error("request body exceeds {max} bytes")]
    RequestTooLarge { max: usize },

    /// Request body was not valid JSON or had no usable shape.
    #[error("malformed request body: {reason}")]
    MalformedBody { reason: String },

    /// No tier matched and no default model is configured.
    #[error("no route for model {client_model:?}")]
    Unroutable { client_model: Option<String> },

    /// Upstream rejected the credentials.
    #[error("upstream authentication failed (status {status})")]
    AuthFailed { status: u16 },

    /// The request exceeds every candidate's context window.
    #[error("request of ~{estimated} tokens exceeds every candidate context window")]
    ContextOverflowGenuine { estimated: usize },

    /// Candidates with sufficient context exist but are temporarily saturated.
    #[error("all candidates with sufficient context are temporarily unavailable")]
    ContextOverflowTransient { retry_after: Duration },

    /// Local backpressure: pool concurrency ceiling or admission queue full.
    #[error("proxy at capacity ({in_flight} in flight, max {max})")]
    Backpressure { in_flight: usize, max: usize },

    /// Admission queue wait exceeded the queue timeout.
    #[error("timed out waiting for admission after {waited:?}")]
    QueueTimeout { waited: Duration },

    /// Admission holds are over their concurrency cap.
    #[error("admission hold capacity exhausted")]
    HoldCapacity,

    /// Every key is excluded, open, or cooling down.
    #[error("no keys available")]
    NoKeysAvailable { retry_after: Option<Duration> },

    /// Global pool cooldown too long to absorb in-process.
    #[error("pool cooling down for {retry_after:?}")]
    PoolCooldown { retry_after: Duration },

    /// Upstream signalled an account-scope quota exhaustion.
    #[error("upstream quota exhausted (retry-after {retry_after:?})")]
    QuotaExhausted { retry_after: Option<Duration> },

    /// Retries exhausted; carries the most representative upstream outcome.
    #[error("upstream failed after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: usize, last: String, retry_after: Option<Duration> },
}

impl ProxyError {
    /// Stable discriminator for the error envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::RequestTooLarge { .. } => "request_too_large",
            Self::MalformedBody { .. } => "malformed_body",
            Self::Unroutable { .. } => "unroutable",
            Self::AuthFailed { .. } => "auth_failed",
            Self::ContextOverflowGenuine { .. } => "context_overflow_genuine",
            Self::ContextOverflowTransient { .. } => "context_overflow_transient",
            Self::Backpressure { .. } => "backpressure",
            Self::QueueTimeout { .. } => "queue_timeout",
            Self::HoldCapacity { .. } => "rate_limit",
            Self::NoKeysAvailable { .. } => "no_keys_available",
            Self::PoolCooldown { .. } => "rate_limit",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            // Clients discriminate on the failure that ended the retry loop.
            Self::AttemptsExhausted { last, .. } => match last.as_str() {
                "rate_limit" => "rate_limit",
                "timeout" => "timeout",
                "server_error" => "server_error",
                "socket_hangup" => "socket_hangup",
                _ => "upstream_exhausted",
            },
        }
    }

    /// Whether a client can expect a later retry to succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::ContextOverflowTransient { .. }
                | Self::Backpressure { .. }
                | Self::QueueTimeout { .. }
                | Self::HoldCapacity
                | Self::NoKeysAvailable { .. }
                | Self::PoolCooldown { .. }
                | Self::QuotaExhausted { .. }
                | Self::AttemptsExhausted { .. }
        )
    }

    /// HTTP status code for the terminal response.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RequestTooLarge { .. } => 413,
            Self::MalformedBody { .. } | Self::Unroutable { .. } => 400,
            Self::ContextOverflowGenuine { .. } => 400,
            Self::AuthFailed { .. } => 401,
            Self::ContextOverflowTransient { .. } => 503,
            Self::Backpressure { .. } | Self::QueueTimeout { .. } => 503,
            Self::HoldCapacity => 429,
            Self::PoolCooldown { .. } => 429,
            Self::QuotaExhausted { .. } => 429,
            Self::NoKeysAvailable { .. } | Self::AttemptsExhausted { .. } => 502,
        }
    }

    /// `retry-after` hint, when one makes sense for this failure.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ContextOverflowTransient { retry_after } | Self::PoolCooldown { retry_after } => {
                Some(*retry_after)
            }
            Self::NoKeysAvailable { retry_after }
            | Self::QuotaExhausted { retry_after }
            | Self::AttemptsExhausted { retry_after, .. } => *retry_after,
            Self::Backpressure { .. } | Self::QueueTimeout { .. } | Self::HoldCapacity => {
                Some(Duration::from_secs(1))
            }
            _ => None,
        }
    }

    /// Wire envelope for non-2xx responses.
    pub fn envelope(&self, request_id: &str) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.to_string(),
            error_type: self.error_type(),
            retryable: self.retryable(),
            request_id: request_id.to_string(),
        }
    }
}

/// JSON body returned on every terminal failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(rename = "errorType")]
    pub error_type: &'static str,
    pub retryable: bool,
    #[serde(rename = "requestId")]
    pub request_id: String,
}
