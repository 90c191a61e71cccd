//! Adaptive per-attempt timeout.
//!
//! Attempts against a key with latency history get a timeout proportional
//! to that key's p95; cold keys get the configured initial value. Retries
//! widen the timeout, and nothing ever exceeds the hard request cap.

use crate::config::TimeoutConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AdaptiveTimeout {
    config: TimeoutConfig,
}

impl AdaptiveTimeout {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Timeout for one attempt given the selected key's latency profile.
    pub fn attempt_timeout(
        &self,
        key_p95_ms: Option<u64>,
        samples: usize,
        retry_idx: usize,
    ) -> Duration {
        let cfg = &self.config;
        let base_ms = match key_p95_ms {
            Some(p95) if samples >= cfg.min_samples => {
                ((p95 as f64 * cfg.latency_multiplier) as u64).clamp(cfg.min_ms, cfg.max_ms)
            }
            _ => cfg.initial_ms,
        };
        let widened =
            (base_ms as f64 * cfg.retry_multiplier.powi(retry_idx.min(8) as i32)) as u64;
        Duration::from_millis(widened.min(cfg.request_timeout_ms))
    }

    /// The hard cap on any client request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }
}
