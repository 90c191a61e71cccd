//! Pool-wide capacity signals.
//!
//! Three detectors observe upstream 429s from different angles:
//!
//! - [`PoolCooldown`]: clustered 429s across the whole pool trip an
//!   escalating global cooldown. Short cooldowns are absorbed locally by the
//!   executor instead of bouncing the client.
//! - [`AccountLimitDetector`]: enough *distinct* keys 429ing inside one
//!   window means the account itself is throttled, not a key.
//! - [`Penalty429`]: a per-model sliding count of recent 429s that the
//!   pool routing strategy uses as a score multiplier, independent of any
//!   cooldown.

use crate::clock::Clock;
use crate::config::{AccountSettings, PenaltySettings, PoolSettings};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct PoolInner {
    recent: VecDeque<u64>,
    level: u32,
    until: u64,
    last_hit_at: u64,
}

/// Global cooldown ladder over clustered pool 429s.
#[derive(Debug)]
pub struct PoolCooldown {
    config: PoolSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<PoolInner>,
}

impl PoolCooldown {
    pub fn new(config: PoolSettings, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, inner: Mutex::new(PoolInner::default()) }
    }

    /// Record one upstream 429. Returns the newly applied global cooldown
    /// when this hit trips the ladder.
    pub fn record_429(&self) -> Option<Duration> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        if inner.last_hit_at > 0
            && now.saturating_sub(inner.last_hit_at) >= self.config.decay_ms
        {
            inner.level = 0;
        }
        inner.last_hit_at = now;

        inner.recent.push_back(now);
        let cutoff = now.saturating_sub(self.config.window_ms);
        while inner.recent.front().is_some_and(|&t| t < cutoff) {
            inner.recent.pop_front();
        }

        if inner.recent.len() < self.config.trigger_count {
            return None;
        }
        let cooldown = self
            .config
            .base_cooldown_ms
            .saturating_mul(1u64 << inner.level.min(16))
            .min(self.config.cap_ms);
        inner.level = inner.level.saturating_add(1);
        inner.until = inner.until.max(now + cooldown);
        inner.recent.clear();
        tracing::warn!(cooldown_ms = cooldown, level = inner.level, "pool cooldown tripped");
        Some(Duration::from_millis(cooldown))
    }

    pub fn remaining(&self) -> Option<Duration> {
        let now = self.clock.now_millis();
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        (inner.until > now).then(|| Duration::from_millis(inner.until - now))
    }

    /// Cooldowns at or below the sleep threshold are absorbed in-process.
    pub fn should_absorb(&self, remaining: Duration) -> bool {
        remaining.as_millis() as u64 <= self.config.sleep_threshold_ms
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner()) = PoolInner::default();
    }
}

/// Sliding-window detector for account-scope throttling.
#[derive(Debug)]
pub struct AccountLimitDetector {
    config: AccountSettings,
    clock: Arc<dyn Clock>,
    hits: Mutex<VecDeque<(u64, usize)>>,
    until: AtomicU64,
}

impl AccountLimitDetector {
    pub fn new(config: AccountSettings, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, hits: Mutex::new(VecDeque::new()), until: AtomicU64::new(0) }
    }

    /// Record a 429 on a key. Returns the account-wide cooldown deadline
    /// when distinct-key hits inside the window reach the threshold.
    pub fn record_429(&self, key_index: usize) -> Option<u64> {
        let now = self.clock.now_millis();
        let mut hits = self.hits.lock().unwrap_or_else(|p| p.into_inner());
        hits.push_back((now, key_index));
        let cutoff = now.saturating_sub(self.config.window_ms);
        while hits.front().is_some_and(|&(t, _)| t < cutoff) {
            hits.pop_front();
        }
        let distinct: HashSet<usize> = hits.iter().map(|&(_, k)| k).collect();
        if distinct.len() < self.config.key_threshold {
            return None;
        }
        let until = now + self.config.cooldown_ms;
        let _ = self
            .until
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| Some(cur.max(until)));
        hits.clear();
        tracing::warn!(
            distinct_keys = distinct.len(),
            cooldown_ms = self.config.cooldown_ms,
            "account-level 429 detected"
        );
        Some(until)
    }

    pub fn active(&self) -> bool {
        self.until.load(Ordering::Acquire) > self.clock.now_millis()
    }

    pub fn remaining(&self) -> Option<Duration> {
        let until = self.until.load(Ordering::Acquire);
        let now = self.clock.now_millis();
        (until > now).then(|| Duration::from_millis(until - now))
    }

    pub fn reset(&self) {
        self.hits.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.until.store(0, Ordering::Release);
    }
}

/// Per-model sliding 429 count feeding pool-strategy scoring.
#[derive(Debug)]
pub struct Penalty429 {
    config: PenaltySettings,
    clock: Arc<dyn Clock>,
    rings: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl Penalty429 {
    pub fn new(config: PenaltySettings, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, rings: Mutex::new(HashMap::new()) }
    }

    pub fn record(&self, model: &str) {
        let now = self.clock.now_millis();
        let mut rings = self.rings.lock().unwrap_or_else(|p| p.into_inner());
        let ring = rings.entry(model.to_string()).or_default();
        ring.push_back(now);
        let cutoff = now.saturating_sub(self.config.window_ms);
        while ring.front().is_some_and(|&t| t < cutoff) {
            ring.pop_front();
        }
    }

    /// Hits inside the window, capped at `max_penalty_hits`.
    pub fn hits(&self, model: &str) -> usize {
        let now = self.clock.now_millis();
        let mut rings = self.rings.lock().unwrap_or_else(|p| p.into_inner());
        let Some(ring) = rings.get_mut(model) else { return 0 };
        let cutoff = now.saturating_sub(self.config.window_ms);
        while ring.front().is_some_and(|&t| t < cutoff) {
            ring.pop_front();
        }
        ring.len().min(self.config.max_penalty_hits)
    }

    /// Multiplier in (0, 1]: `1 / (1 + hits * weight)`.
    pub fn factor(&self, model: &str) -> f64 {
        1.0 / (1.0 + self.hits(model) as f64 * self.config.weight)
    }

    pub fn reset(&self) {
        self.rings.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}
