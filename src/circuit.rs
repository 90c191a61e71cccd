//! Per-key circuit breaker.
//!
//! CLOSED records failures in a rolling time window; crossing the threshold
//! opens the circuit. OPEN rejects locally until the cooldown elapses, then
//! HALF_OPEN admits exactly one probe. Probe success closes the circuit;
//! probe failure, or a probe that never reports back within the half-open
//! timeout, reopens it.

use crate::clock::Clock;
use crate::config::CircuitConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CLOSED" => Ok(Self::Closed),
            "OPEN" => Ok(Self::Open),
            "HALF_OPEN" | "HALF-OPEN" => Ok(Self::HalfOpen),
            other => Err(format!("unknown circuit state {other:?}")),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Failure timestamps within the rolling window, oldest first.
    failures: VecDeque<u64>,
    opened_at: u64,
    next_probe_at: u64,
    /// Set while a half-open probe is in flight.
    probe_started_at: Option<u64>,
}

/// Observable state for `/stats` and control endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: usize,
    #[serde(rename = "openedAt")]
    pub opened_at: u64,
    #[serde(rename = "nextProbeAt")]
    pub next_probe_at: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: 0,
                next_probe_at: 0,
                probe_started_at: None,
            }),
            config,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stale records must be purged before any threshold evaluation.
    fn purge(inner: &mut Inner, window_ms: u64, now: u64) {
        let cutoff = now.saturating_sub(window_ms);
        while inner.failures.front().is_some_and(|&t| t < cutoff) {
            inner.failures.pop_front();
        }
    }

    /// Whether a caller may send through this key right now. A `true` answer
    /// in half-open claims the single probe slot.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now >= inner.next_probe_at {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started_at = Some(now);
                    tracing::info!("circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                match inner.probe_started_at {
                    // Probe hung past the half-open timeout: reopen.
                    Some(started) if now.saturating_sub(started) >= self.config.half_open_timeout_ms => {
                        Self::reopen(&mut inner, &self.config, now);
                        false
                    }
                    Some(_) => false,
                    None => {
                        inner.probe_started_at = Some(now);
                        true
                    }
                }
            }
        }
    }

    /// Effective state with time-based transitions applied (read-only probes
    /// are not claimed).
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now_millis();
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if now >= inner.next_probe_at => CircuitState::HalfOpen,
            s => s,
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.probe_started_at = None;
                tracing::info!("circuit closed after successful probe");
            }
            CircuitState::Closed => {
                inner.failures.clear();
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                Self::reopen(&mut inner, &self.config, now);
                tracing::warn!("circuit reopened, probe failed");
            }
            CircuitState::Closed => {
                inner.failures.push_back(now);
                Self::purge(&mut inner, self.config.failure_window_ms, now);
                if inner.failures.len() >= self.config.failure_threshold {
                    Self::reopen(&mut inner, &self.config, now);
                    tracing::error!(
                        failures = inner.failures.len(),
                        threshold = self.config.failure_threshold,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn reopen(inner: &mut Inner, config: &CircuitConfig, now: u64) {
        inner.state = CircuitState::Open;
        inner.opened_at = now;
        // next_probe_at only moves forward within an open interval.
        inner.next_probe_at = inner.next_probe_at.max(now + config.cooldown_period_ms);
        inner.probe_started_at = None;
    }

    /// Force a state from the control surface.
    pub fn force(&self, state: CircuitState) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.probe_started_at = None;
        match state {
            CircuitState::Closed => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.next_probe_at = 0;
            }
            CircuitState::Open => {
                inner.state = CircuitState::Open;
                inner.opened_at = now;
                inner.next_probe_at = now + self.config.cooldown_period_ms;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::HalfOpen;
            }
        }
        tracing::info!(?state, "circuit state forced");
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        Self::purge(&mut inner, self.config.failure_window_ms, now);
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failures.len(),
            opened_at: inner.opened_at,
            next_probe_at: inner.next_probe_at,
        }
    }
}
