//! Request admission.
//!
//! Two gates sit in front of the attempt loop. The backpressure gate caps
//! total in-flight work: past the ceiling, callers queue FIFO up to the
//! queue capacity and timeout, then get a 503. The admission hold converts
//! a guaranteed-to-fail upstream send (every model in the tier cooling
//! down) into a bounded local sleep followed by re-selection.

use crate::config::{AdmissionConfig, HoldConfig};
use crate::sleeper::Sleeper;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("admission queue full ({waiting} waiting, capacity {capacity})")]
    QueueFull { waiting: usize, capacity: usize },
    #[error("admission wait timed out after {waited:?}")]
    Timeout { waited: Duration },
    #[error("proxy is paused")]
    Paused,
}

/// Holds one unit of total concurrency until dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// FIFO backpressure gate over total concurrency.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    max: usize,
    queue_capacity: usize,
    queue_timeout: Duration,
    waiting: AtomicUsize,
    paused: AtomicBool,
}

impl AdmissionGate {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_total_concurrency)),
            max: config.max_total_concurrency,
            queue_capacity: config.queue_capacity,
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
            waiting: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
        }
    }

    pub async fn admit(&self) -> Result<AdmissionPermit, AdmissionError> {
        if self.paused.load(Ordering::Acquire) {
            return Err(AdmissionError::Paused);
        }
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(AdmissionPermit { _permit: permit });
        }

        let waiting = self.waiting.fetch_add(1, Ordering::AcqRel);
        if waiting >= self.queue_capacity {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
            return Err(AdmissionError::QueueFull {
                waiting,
                capacity: self.queue_capacity,
            });
        }
        // Semaphore wakeups are FIFO, which is exactly the queue order we
        // promise to clients.
        let acquired =
            tokio::time::timeout(self.queue_timeout, self.semaphore.clone().acquire_owned()).await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        match acquired {
            Ok(Ok(permit)) => Ok(AdmissionPermit { _permit: permit }),
            // Semaphore is never closed.
            Ok(Err(_)) | Err(_) => Err(AdmissionError::Timeout { waited: self.queue_timeout }),
        }
    }

    pub fn in_use(&self) -> usize {
        self.max.saturating_sub(self.semaphore.available_permits())
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        tracing::warn!("admission paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        tracing::info!("admission resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// Outcome of a tier admission hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    /// Slept this long; caller should re-select.
    Held(Duration),
    /// Cooldown too short to be worth a hold; send immediately.
    NotWorthHolding,
    /// Concurrent holds at the cap; caller returns 429.
    OverCapacity,
}

#[derive(Debug)]
pub struct AdmissionHold {
    config: HoldConfig,
    active: AtomicUsize,
    sleeper: Arc<dyn Sleeper>,
}

impl AdmissionHold {
    pub fn new(config: HoldConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, active: AtomicUsize::new(0), sleeper }
    }

    /// Sleep out a tier cooldown, bounded by `max_hold_ms` and the global
    /// hold cap. The elapsed hold is excluded from retry wall-clock budgets
    /// by the caller.
    pub async fn hold(&self, tier_cooldown: Duration) -> HoldOutcome {
        if (tier_cooldown.as_millis() as u64) <= self.config.min_cooldown_to_hold_ms {
            return HoldOutcome::NotWorthHolding;
        }
        let claimed = self.active.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < self.config.max_concurrent_holds).then_some(n + 1)
        });
        if claimed.is_err() {
            return HoldOutcome::OverCapacity;
        }
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..=self.config.jitter_percent);
        let wait = Duration::from_millis(
            ((tier_cooldown.as_millis() as f64 * jitter) as u64).min(self.config.max_hold_ms),
        );
        tracing::debug!(wait_ms = wait.as_millis() as u64, "admission hold");
        self.sleeper.sleep(wait).await;
        self.active.fetch_sub(1, Ordering::AcqRel);
        HoldOutcome::Held(wait)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}
