//! In-memory request statistics.
//!
//! Lossy-read counters plus a global latency window; the `/stats` endpoint
//! serializes a snapshot, and the counters registry documents every counter
//! for the dashboard.

use crate::clock::epoch_millis;
use crate::sched::LatencyWindow;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct StatsAggregator {
    started_at: AtomicU64,
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    model_switches: AtomicU64,
    admission_rejects: AtomicU64,
    failure_kinds: Mutex<BTreeMap<&'static str, u64>>,
    latency: Mutex<LatencyWindow>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            started_at: AtomicU64::new(epoch_millis()),
            total_requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            model_switches: AtomicU64::new(0),
            admission_rejects: AtomicU64::new(0),
            failure_kinds: Mutex::new(BTreeMap::new()),
            latency: Mutex::new(LatencyWindow::new(512)),
        }
    }

    pub fn record_admitted(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_reject(&self) {
        self.admission_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_switch(&self) {
        self.model_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, latency_ms: u64) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.latency.lock().unwrap_or_else(|p| p.into_inner()).push(latency_ms);
    }

    pub fn record_failure(&self, error_type: &'static str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self
            .failure_kinds
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(error_type)
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> Value {
        let latency = self.latency.lock().unwrap_or_else(|p| p.into_inner());
        json!({
            "uptimeMs": epoch_millis().saturating_sub(self.started_at.load(Ordering::Relaxed)),
            "totalRequests": self.total_requests.load(Ordering::Relaxed),
            "successes": self.successes.load(Ordering::Relaxed),
            "failures": self.failures.load(Ordering::Relaxed),
            "retries": self.retries.load(Ordering::Relaxed),
            "modelSwitches": self.model_switches.load(Ordering::Relaxed),
            "admissionRejects": self.admission_rejects.load(Ordering::Relaxed),
            "failureKinds": self.failure_kinds.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            "latency": {
                "p50Ms": latency.percentile(50.0),
                "p95Ms": latency.percentile(95.0),
                "p99Ms": latency.percentile(99.0),
                "samples": latency.len(),
            },
        })
    }

    /// Counter registry for `GET /model-routing/counters`.
    pub fn counters_registry(&self) -> Value {
        fn counter(description: &str, labels: &[&str], reset: &str) -> Value {
            json!({ "description": description, "labels": labels, "reset": reset })
        }
        json!({
            "version": "1.0",
            "timestamp": epoch_millis(),
            "counters": {
                "totalRequests": counter("Requests admitted past the backpressure gate", &[], "process"),
                "successes": counter("Requests answered with a 2xx from upstream", &[], "process"),
                "failures": counter("Requests terminated with an error envelope", &["errorType"], "process"),
                "retries": counter("Upstream attempts beyond the first", &[], "process"),
                "modelSwitches": counter("Mid-request model switches", &[], "process"),
                "admissionRejects": counter("Requests refused at the backpressure gate", &[], "process"),
                "glm5ShadowHits": counter("Medium-tier selections that would have preferred glm-5", &[], "config"),
            },
        })
    }

    pub fn reset(&self) {
        self.started_at.store(epoch_millis(), Ordering::Relaxed);
        self.total_requests.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.model_switches.store(0, Ordering::Relaxed);
        self.admission_rejects.store(0, Ordering::Relaxed);
        self.failure_kinds.lock().unwrap_or_else(|p| p.into_inner()).clear();
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = LatencyWindow::new(512);
    }
}
