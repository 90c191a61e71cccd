//! Per-model cooldown map.
//!
//! Entries escalate with repeat hits, extend-only (`cooldown_until` is
//! max-semantic so a late burst can never shorten an existing cooldown),
//! decay after a long quiet period, and evict LRU by `last_hit_at` once the
//! map outgrows its capacity.

use crate::clock::Clock;
use crate::config::CooldownConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownEntry {
    pub count: u32,
    pub last_hit_at: u64,
    pub cooldown_until: u64,
    pub last_burst_dampened: bool,
}

#[derive(Debug)]
pub struct CooldownMap {
    entries: Mutex<HashMap<String, CooldownEntry>>,
    clock: Arc<dyn Clock>,
}

impl CooldownMap {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CooldownEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record a cooldown hit. An explicit duration (upstream `retry-after`)
    /// wins; otherwise the escalation ladder computes one. Burst-dampened
    /// hits extend the deadline without feeding the ladder.
    pub fn record(
        &self,
        model: &str,
        duration: Option<Duration>,
        burst_dampened: bool,
        cfg: &CooldownConfig,
    ) {
        let now = self.clock.now_millis();
        let mut entries = self.lock();

        let stale = entries
            .get(model)
            .map_or(true, |e| now.saturating_sub(e.last_hit_at) >= cfg.decay_ms);
        if stale {
            entries.insert(
                model.to_string(),
                CooldownEntry {
                    count: 0,
                    last_hit_at: now,
                    cooldown_until: 0,
                    last_burst_dampened: false,
                },
            );
        }
        let entry = entries.get_mut(model).expect("entry present after insert");

        if !burst_dampened {
            entry.count = entry.count.saturating_add(1);
        }
        let level = entry.count.saturating_sub(1).min(16);
        let computed = cfg.base_ms.saturating_mul(1u64 << level).min(cfg.cap_ms);
        let wait = duration
            .map(|d| (d.as_millis() as u64).min(cfg.cap_ms))
            .unwrap_or(computed);
        entry.cooldown_until = entry.cooldown_until.max(now + wait);
        entry.last_hit_at = now;
        entry.last_burst_dampened = burst_dampened;

        if entries.len() > cfg.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_hit_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
                tracing::debug!(model = %oldest, "cooldown entry evicted (lru)");
            }
        }
    }

    /// Remaining cooldown for a model; decayed entries evaporate here.
    pub fn remaining(&self, model: &str, cfg: &CooldownConfig) -> Option<Duration> {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        let (last_hit_at, cooldown_until) = match entries.get(model) {
            Some(e) => (e.last_hit_at, e.cooldown_until),
            None => return None,
        };
        if now.saturating_sub(last_hit_at) >= cfg.decay_ms {
            entries.remove(model);
            return None;
        }
        (cooldown_until > now).then(|| Duration::from_millis(cooldown_until - now))
    }

    pub fn is_cooled(&self, model: &str, cfg: &CooldownConfig) -> bool {
        self.remaining(model, cfg).is_some()
    }

    /// Shortest remaining cooldown across `models`, ignoring un-cooled ones.
    pub fn shortest_remaining(&self, models: &[String], cfg: &CooldownConfig) -> Option<Duration> {
        models.iter().filter_map(|m| self.remaining(m, cfg)).min()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.lock().contains_key(model)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, CooldownEntry> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
