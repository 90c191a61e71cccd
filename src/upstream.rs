//! Upstream HTTP client.
//!
//! One shared keep-alive client sends provider-dialect requests: the client
//! body with the `model` field substituted, bearer auth from the scheduled
//! key. Response headers that steer the capacity fabric (`retry-after`,
//! `x-ratelimit-remaining`, `x-request-id`) are parsed here. Repeated
//! socket hangups trigger a throttled client (agent) recreation to shed
//! poisoned connections.

use crate::clock::Clock;
use crate::config::UpstreamConfig;
use crate::keys::Key;
use arc_swap::ArcSwap;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream attempt timed out")]
    Timeout,
    #[error("upstream connect failed: {0}")]
    Connect(String),
    #[error("upstream connection dropped: {0}")]
    Hangup(String),
}

/// Parsed response envelope; the body stays inside `response` for the
/// caller to buffer or stream.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub ratelimit_remaining: Option<u64>,
    pub request_id: Option<String>,
    pub content_type: Option<String>,
    pub response: reqwest::Response,
}

pub struct UpstreamClient {
    client: ArcSwap<reqwest::Client>,
    config: UpstreamConfig,
    last_recreated_at: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig, clock: Arc<dyn Clock>) -> Self {
        let client = Self::build_client(&config);
        Self { client: ArcSwap::from_pointee(client), config, last_recreated_at: AtomicU64::new(0), clock }
    }

    fn build_client(config: &UpstreamConfig) -> reqwest::Client {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .pool_idle_timeout(Duration::from_millis(config.free_socket_timeout_ms))
            .build()
            .unwrap_or_default()
    }

    fn url(&self) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.messages_path
        )
    }

    /// Send one attempt. `body` already carries the substituted provider
    /// model. For buffered requests the timeout covers connect through body;
    /// for streaming requests it covers only the wait for response headers,
    /// so a long event stream is never cut off mid-flight.
    pub async fn send(
        &self,
        key: &Key,
        body: Bytes,
        timeout: Duration,
        streaming: bool,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let client = self.client.load_full();
        let mut request = client
            .post(self.url())
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", key.bearer()))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if self.config.send_x_api_key {
            request = request.header("x-api-key", key.bearer().to_string());
        }

        let response = if streaming {
            match tokio::time::timeout(timeout, request.send()).await {
                Ok(sent) => sent.map_err(classify_error)?,
                Err(_) => return Err(UpstreamError::Timeout),
            }
        } else {
            request.timeout(timeout).send().await.map_err(classify_error)?
        };
        let status = response.status().as_u16();
        let headers = response.headers();
        Ok(UpstreamResponse {
            status,
            retry_after: parse_retry_after(headers),
            ratelimit_remaining: parse_u64_header(headers, "x-ratelimit-remaining"),
            request_id: headers
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            content_type: headers
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            response,
        })
    }

    /// Recreate the shared client after repeated hangups, at most once per
    /// recreation cooldown.
    pub fn maybe_recreate(&self, consecutive_hangups: usize) -> bool {
        if consecutive_hangups < self.config.max_consecutive_hangups {
            return false;
        }
        let now = self.clock.now_millis();
        let last = self.last_recreated_at.load(Ordering::Acquire);
        if last > 0 && now.saturating_sub(last) < self.config.agent_recreation_cooldown_ms {
            return false;
        }
        if self
            .last_recreated_at
            .compare_exchange(last, now.max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.client.store(Arc::new(Self::build_client(&self.config)));
        tracing::warn!(consecutive_hangups, "upstream client recreated after hangups");
        true
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }
}

fn classify_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout
    } else if err.is_connect() {
        UpstreamError::Connect(err.to_string())
    } else {
        UpstreamError::Hangup(err.to_string())
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_u64_header(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(
            reqwest::header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None, "http-date form is ignored");
    }

    #[test]
    fn ratelimit_remaining_parses() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("7"));
        assert_eq!(parse_u64_header(&headers, "x-ratelimit-remaining"), Some(7));
        assert_eq!(parse_u64_header(&headers, "missing"), None);
    }

    #[test]
    fn recreation_respects_threshold_and_cooldown() {
        let clock = Arc::new(ManualClock::new());
        let client = UpstreamClient::new(
            UpstreamConfig {
                max_consecutive_hangups: 3,
                agent_recreation_cooldown_ms: 10_000,
                ..UpstreamConfig::default()
            },
            clock.clone(),
        );
        assert!(!client.maybe_recreate(2), "below threshold");
        assert!(client.maybe_recreate(3));
        assert!(!client.maybe_recreate(5), "cooldown throttles recreation");
        clock.advance(10_001);
        assert!(client.maybe_recreate(5));
    }

    #[test]
    fn url_joins_base_and_path() {
        let clock = Arc::new(ManualClock::new());
        let client = UpstreamClient::new(
            UpstreamConfig {
                base_url: "https://open.bigmodel.cn/api/anthropic/".into(),
                messages_path: "/v1/messages".into(),
                ..UpstreamConfig::default()
            },
            clock,
        );
        assert_eq!(client.url(), "https://open.bigmodel.cn/api/anthropic/v1/messages");
    }
}
