//! Per-model adaptive concurrency (AIMD).
//!
//! Each provider model carries an effective-concurrency window tuned from
//! upstream 429 feedback: multiplicative decrease on congestion, additive
//! (or proportional) growth after a clean recovery period, and idle drift
//! back toward the static ceiling. 429s whose `retry-after` marks them as
//! quota exhaustion are exempt from the decrease — quota is not congestion.
//!
//! In observe-only mode the controller computes and logs but the static
//! limits keep serving; enforce mode serves `min(window, static)`.

use crate::clock::Clock;
use crate::config::{AimdSettings, GrowthMode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug)]
struct ModelWindow {
    window: AtomicUsize,
    static_max: usize,
    /// Congestion observed since the last adjustment; consumed by a tick.
    congestion_pending: AtomicBool,
    last_congestion_at: AtomicU64,
    clean_ticks: AtomicU32,
    last_adjust_at: AtomicU64,
    last_traffic_at: AtomicU64,
}

impl ModelWindow {
    fn new(static_max: usize, now: u64) -> Self {
        Self {
            window: AtomicUsize::new(static_max),
            static_max,
            congestion_pending: AtomicBool::new(false),
            last_congestion_at: AtomicU64::new(0),
            clean_ticks: AtomicU32::new(0),
            last_adjust_at: AtomicU64::new(0),
            last_traffic_at: AtomicU64::new(now),
        }
    }
}

/// Observable window state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSnapshot {
    pub model: String,
    pub window: usize,
    pub static_max: usize,
    pub enforced: bool,
}

pub struct AdaptiveConcurrency {
    windows: RwLock<HashMap<String, Arc<ModelWindow>>>,
    settings: AimdSettings,
    clock: Arc<dyn Clock>,
}

impl AdaptiveConcurrency {
    pub fn new(settings: AimdSettings, clock: Arc<dyn Clock>) -> Self {
        Self { windows: RwLock::new(HashMap::new()), settings, clock }
    }

    /// Register a model with its static ceiling; idempotent.
    pub fn register(&self, model: &str, static_max: usize) {
        let mut windows = self.windows.write().unwrap_or_else(|p| p.into_inner());
        windows
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(ModelWindow::new(static_max, self.clock.now_millis())));
    }

    fn get(&self, model: &str) -> Option<Arc<ModelWindow>> {
        self.windows.read().unwrap_or_else(|p| p.into_inner()).get(model).cloned()
    }

    pub fn observe_request(&self, model: &str) {
        if let Some(w) = self.get(model) {
            w.last_traffic_at.store(self.clock.now_millis(), Ordering::Relaxed);
        }
    }

    /// Feed a 429. Quota-classified events (long `retry-after`) do not count
    /// as congestion.
    pub fn observe_429(&self, model: &str, retry_after: Option<Duration>) {
        let quota = retry_after
            .is_some_and(|d| d.as_millis() as u64 > self.settings.quota_retry_after_ms);
        if quota {
            tracing::debug!(model, "quota 429, exempt from window decrease");
            return;
        }
        if let Some(w) = self.get(model) {
            w.congestion_pending.store(true, Ordering::Release);
        }
    }

    /// One controller tick over every window.
    pub fn tick(&self) {
        let now = self.clock.now_millis();
        let windows = self.windows.read().unwrap_or_else(|p| p.into_inner());
        for (model, w) in windows.iter() {
            self.tick_window(model, w, now);
        }
    }

    fn tick_window(&self, model: &str, w: &ModelWindow, now: u64) {
        let s = &self.settings;
        // last_adjust_at == 0 means no adjustment has happened yet.
        let last_adjust = w.last_adjust_at.load(Ordering::Acquire);
        let held = last_adjust > 0 && now.saturating_sub(last_adjust) < s.min_hold_ms;

        if w.congestion_pending.load(Ordering::Acquire) {
            if held {
                return; // signal stays pending until the hold expires
            }
            w.congestion_pending.store(false, Ordering::Release);
            w.last_congestion_at.store(now, Ordering::Relaxed);
            w.clean_ticks.store(0, Ordering::Relaxed);
            let cur = w.window.load(Ordering::Acquire);
            let next = ((cur as f64 * s.decrease_factor).floor() as usize).max(s.min_window);
            if next != cur {
                w.window.store(next, Ordering::Release);
                w.last_adjust_at.store(now, Ordering::Release);
                tracing::info!(model, from = cur, to = next, "aimd window decreased");
            }
            return;
        }

        let clean = w.clean_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let idle =
            now.saturating_sub(w.last_traffic_at.load(Ordering::Relaxed)) >= s.idle_timeout_ms;
        let cur = w.window.load(Ordering::Acquire);

        if idle {
            // Idle windows drift back toward the static ceiling.
            if cur < w.static_max {
                let next = cur.saturating_add(s.idle_decay_step).min(w.static_max);
                w.window.store(next, Ordering::Release);
            }
            return;
        }

        let recovered =
            now.saturating_sub(w.last_congestion_at.load(Ordering::Relaxed)) >= s.recovery_delay_ms;
        if recovered && clean >= s.growth_clean_ticks && !held && cur < w.static_max {
            let next = match s.growth_mode {
                GrowthMode::Additive => cur + 1,
                GrowthMode::Proportional => cur + (cur / 10).max(1),
            }
            .min(w.static_max);
            w.window.store(next, Ordering::Release);
            w.last_adjust_at.store(now, Ordering::Release);
            w.clean_ticks.store(0, Ordering::Relaxed);
            tracing::debug!(model, from = cur, to = next, "aimd window grew");
        }
    }

    /// The limit the router should enforce for a model.
    pub fn effective_limit(&self, model: &str, static_max: usize) -> usize {
        if !self.settings.enforce {
            return static_max;
        }
        match self.get(model) {
            Some(w) => w.window.load(Ordering::Acquire).min(static_max),
            None => static_max,
        }
    }

    pub fn snapshot(&self) -> Vec<WindowSnapshot> {
        let windows = self.windows.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<WindowSnapshot> = windows
            .iter()
            .map(|(model, w)| WindowSnapshot {
                model: model.clone(),
                window: w.window.load(Ordering::Acquire),
                static_max: w.static_max,
                enforced: self.settings.enforce,
            })
            .collect();
        out.sort_by(|a, b| a.model.cmp(&b.model));
        out
    }

    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let windows = self.windows.read().unwrap_or_else(|p| p.into_inner());
        for w in windows.values() {
            w.window.store(w.static_max, Ordering::Release);
            w.congestion_pending.store(false, Ordering::Release);
            w.last_congestion_at.store(0, Ordering::Relaxed);
            w.clean_ticks.store(0, Ordering::Relaxed);
            w.last_adjust_at.store(0, Ordering::Relaxed);
            w.last_traffic_at.store(now, Ordering::Relaxed);
        }
    }

    /// Background ticker at the configured interval.
    pub fn spawn_ticker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.settings.tick_interval_ms.max(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.tick();
            }
        })
    }
}
