//! Retry orchestration.
//!
//! Each upstream attempt resolves to an [`AttemptOutcome`]; the orchestrator
//! maps it to the next action: succeed, retry on another key, retry on
//! another model, or give up. Exit conditions (attempt cap, model-switch
//! cap, wall-clock window) are enforced here so the executor's loop stays a
//! straight line.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Terminal classification of one upstream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success { status: u16 },
    /// 429 from upstream, with `retry-after` when supplied.
    RateLimited { retry_after_ms: Option<u64> },
    /// Non-retryable 4xx (not 408, not 429, not auth).
    ClientError { status: u16 },
    AuthFailed { status: u16 },
    ServerError { status: u16 },
    Timeout,
    SocketHangup,
}

impl AttemptOutcome {
    /// Classify an upstream HTTP status. Timeouts and hangups are produced
    /// by the transport layer, not here.
    pub fn from_status(status: u16, retry_after_ms: Option<u64>) -> Self {
        match status {
            s if (200..300).contains(&s) => Self::Success { status: s },
            429 => Self::RateLimited { retry_after_ms },
            401 | 403 => Self::AuthFailed { status },
            // 408 behaves like a transport timeout.
            408 => Self::Timeout,
            s if (400..500).contains(&s) => Self::ClientError { status: s },
            s => Self::ServerError { status: s },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Short label used in logs and the request-complete event.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::RateLimited { .. } => "rate_limit",
            Self::ClientError { .. } => "client_error",
            Self::AuthFailed { .. } => "auth_failed",
            Self::ServerError { .. } => "server_error",
            Self::Timeout => "timeout",
            Self::SocketHangup => "socket_hangup",
        }
    }
}

/// Why the orchestrator stopped retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveUpReason {
    ClientError { status: u16 },
    AuthFailed { status: u16 },
    /// 429 whose `retry-after` marks account quota exhaustion.
    Quota { retry_after_ms: u64 },
    AttemptsExhausted,
    ModelSwitchBudgetExhausted,
    RetryWindowExhausted,
}

/// Next step for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    Succeed,
    /// Release the model slot, pick a new model (and usually a new key).
    RetrySwitchModel { delay: Duration, exclude_key: bool },
    /// Keep the model, burn the key.
    RetrySwitchKey { delay: Duration },
    GiveUp(GiveUpReason),
}

/// Progress counters owned by the executor's attempt loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopProgress {
    /// Attempts completed so far (the one being decided included).
    pub attempts: usize,
    pub model_switches: usize,
    /// Wall-clock in the retry loop, admission-hold time excluded.
    pub elapsed_ms: u64,
}

#[derive(Debug)]
pub struct RetryOrchestrator {
    config: RetryConfig,
}

impl RetryOrchestrator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Map an outcome to the next action, enforcing every exit condition.
    pub fn decide(&self, outcome: &AttemptOutcome, progress: &LoopProgress) -> RetryAction {
        match outcome {
            AttemptOutcome::Success { .. } => return RetryAction::Succeed,
            AttemptOutcome::ClientError { status } => {
                return RetryAction::GiveUp(GiveUpReason::ClientError { status: *status })
            }
            AttemptOutcome::AuthFailed { status } => {
                return RetryAction::GiveUp(GiveUpReason::AuthFailed { status: *status })
            }
            _ => {}
        }

        if progress.attempts >= self.config.max_retries {
            return RetryAction::GiveUp(GiveUpReason::AttemptsExhausted);
        }
        if progress.elapsed_ms >= self.config.max_429_retry_window_ms {
            return RetryAction::GiveUp(GiveUpReason::RetryWindowExhausted);
        }

        let retry_idx = progress.attempts.saturating_sub(1);
        match outcome {
            AttemptOutcome::RateLimited { retry_after_ms } => {
                if let Some(ra) = retry_after_ms {
                    if *ra > self.config.quota_retry_after_ms {
                        return RetryAction::GiveUp(GiveUpReason::Quota { retry_after_ms: *ra });
                    }
                }
                if progress.model_switches >= self.config.max_429_attempts_per_request {
                    // Out of model switches: burn another key instead.
                    return RetryAction::RetrySwitchKey {
                        delay: self.backoff_delay(retry_idx, *retry_after_ms),
                    };
                }
                // The key that just 429'd sits out the rest of this request;
                // its own cooldown ladder covers future requests.
                RetryAction::RetrySwitchModel {
                    delay: self.backoff_delay(retry_idx, *retry_after_ms),
                    exclude_key: true,
                }
            }
            AttemptOutcome::ServerError { .. }
            | AttemptOutcome::Timeout
            | AttemptOutcome::SocketHangup => {
                RetryAction::RetrySwitchKey { delay: self.backoff_delay(retry_idx, None) }
            }
            AttemptOutcome::Success { .. }
            | AttemptOutcome::ClientError { .. }
            | AttemptOutcome::AuthFailed { .. } => unreachable!("handled above"),
        }
    }

    /// `min(max, base * multiplier^idx) * (1 ± jitter)`, or the upstream
    /// `retry-after` capped by `max_cooldown_ms` when present.
    pub fn backoff_delay(&self, retry_idx: usize, retry_after_ms: Option<u64>) -> Duration {
        if let Some(ra) = retry_after_ms {
            return Duration::from_millis(ra.min(self.config.max_cooldown_ms));
        }
        let exp = self.config.backoff_multiplier.powi(retry_idx.min(16) as i32);
        let base = (self.config.base_delay_ms as f64 * exp).min(self.config.max_delay_ms as f64);
        let jitter = if self.config.jitter_percent > 0.0 {
            rand::thread_rng().gen_range(-self.config.jitter_percent..=self.config.jitter_percent)
        } else {
            0.0
        };
        Duration::from_millis((base * (1.0 + jitter)).max(0.0) as u64)
    }
}
