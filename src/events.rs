//! Live event fan-out for dashboard clients.
//!
//! Subscribers receive an `init` event with recent request summaries, then
//! `request-complete` events as requests finish and periodic `pool-status`
//! snapshots. The pool-status timer runs only while at least one subscriber
//! is connected: it starts on the 0→1 transition and stops on 1→0. Every
//! emitted event carries a strictly increasing `seq`.

use crate::clock::epoch_millis;
use crate::router::ModelRouter;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const RECENT_CAPACITY: usize = 50;
const CHANNEL_CAPACITY: usize = 256;

/// Published when a request's response body closes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCompleteEvent {
    pub path: String,
    pub timestamp: u64,
    pub request_id: String,
    pub model: String,
    pub tier: String,
    pub strategy: String,
    pub latency_ms: u64,
    pub success: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,
}

/// One event on the wire: SSE event name plus serialized payload.
#[derive(Debug, Clone)]
pub struct WireEvent {
    pub name: &'static str,
    pub data: String,
}

pub struct SseBroadcaster {
    tx: broadcast::Sender<WireEvent>,
    seq: AtomicU64,
    subscribers: AtomicUsize,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    recent: Mutex<VecDeque<RequestCompleteEvent>>,
    router: Arc<ModelRouter>,
    interval: Duration,
}

impl SseBroadcaster {
    pub fn new(router: Arc<ModelRouter>, interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            seq: AtomicU64::new(0),
            subscribers: AtomicUsize::new(0),
            timer: Mutex::new(None),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            router,
            interval,
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn emit(&self, name: &'static str, mut payload: Value) {
        let seq = self.next_seq();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("seq".into(), json!(seq));
            obj.insert("ts".into(), json!(epoch_millis()));
            obj.insert("type".into(), json!(name));
        }
        // Send errors just mean nobody is listening.
        let _ = self.tx.send(WireEvent { name, data: payload.to_string() });
    }

    /// Publish a request lifecycle completion and remember it for `init`.
    pub fn publish_request_complete(&self, event: RequestCompleteEvent) {
        {
            let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        let payload = serde_json::to_value(&event).unwrap_or_else(|_| json!({}));
        self.emit("request-complete", payload);
    }

    fn emit_pool_status(&self) {
        self.emit(
            "pool-status",
            json!({
                "schemaVersion": 1,
                "pools": self.router.pool_status(),
            }),
        );
    }

    /// Register a subscriber. Starting the pool-status timer happens on the
    /// 0→1 transition.
    pub fn subscribe(this: &Arc<Self>) -> SseSubscription {
        let rx = this.tx.subscribe();
        let previous = this.subscribers.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            Self::start_timer(this);
        }
        let init = json!({
            "type": "init",
            "recentRequests": this
                .recent
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .collect::<Vec<_>>(),
        });
        SseSubscription { init, rx, _guard: SubscriberGuard { broadcaster: this.clone() } }
    }

    fn start_timer(this: &Arc<Self>) {
        let broadcaster = this.clone();
        let interval = this.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would duplicate the init snapshot.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broadcaster.emit_pool_status();
            }
        });
        let mut timer = this.timer.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = timer.replace(handle) {
            old.abort();
        }
        tracing::debug!("pool-status timer started");
    }

    fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
            tracing::debug!("pool-status timer stopped");
        }
    }

    fn on_unsubscribe(&self) {
        let previous = self.subscribers.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.stop_timer();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    pub fn timer_active(&self) -> bool {
        self.timer.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn clear_recent(&self) {
        self.recent.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

/// Live subscription: initial snapshot plus the event stream. Dropping it
/// decrements the subscriber count (stopping the timer at zero).
pub struct SseSubscription {
    pub init: Value,
    pub rx: broadcast::Receiver<WireEvent>,
    _guard: SubscriberGuard,
}

struct SubscriberGuard {
    broadcaster: Arc<SseBroadcaster>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.broadcaster.on_unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aimd::AdaptiveConcurrency;
    use crate::catalog::ModelCatalog;
    use crate::clock::ManualClock;
    use crate::config::{AimdSettings, PenaltySettings, RouterConfig};
    use crate::pool::Penalty429;

    fn broadcaster() -> Arc<SseBroadcaster> {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = RouterConfig::default();
        cfg.overrides_file = "/nonexistent/x.json".into();
        let router = Arc::new(ModelRouter::new(
            cfg,
            Arc::new(ModelCatalog::builtin()),
            Arc::new(Penalty429::new(PenaltySettings::default(), clock.clone())),
            Arc::new(AdaptiveConcurrency::new(AimdSettings::default(), clock.clone())),
            clock,
        ));
        Arc::new(SseBroadcaster::new(router, Duration::from_millis(20)))
    }

    fn sample_event(id: &str) -> RequestCompleteEvent {
        RequestCompleteEvent {
            path: "/v1/messages".into(),
            timestamp: 1,
            request_id: id.into(),
            model: "glm-5".into(),
            tier: "heavy".into(),
            strategy: "quality".into(),
            latency_ms: 42,
            success: true,
            status: 200,
            trace: None,
        }
    }

    #[tokio::test]
    async fn timer_runs_iff_subscribers_exist() {
        let b = broadcaster();
        assert!(!b.timer_active());
        let sub1 = SseBroadcaster::subscribe(&b);
        assert!(b.timer_active());
        let sub2 = SseBroadcaster::subscribe(&b);
        assert!(b.timer_active());
        drop(sub1);
        assert!(b.timer_active(), "still one subscriber");
        drop(sub2);
        assert!(!b.timer_active(), "timer stops on last unsubscribe");
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing_across_event_kinds() {
        let b = broadcaster();
        let mut sub = SseBroadcaster::subscribe(&b);
        b.publish_request_complete(sample_event("r1"));
        b.emit_pool_status();
        b.publish_request_complete(sample_event("r2"));

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let ev = sub.rx.recv().await.unwrap();
            let v: Value = serde_json::from_str(&ev.data).unwrap();
            seqs.push(v["seq"].as_u64().unwrap());
        }
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs {seqs:?} not increasing");
    }

    #[tokio::test]
    async fn init_carries_recent_requests() {
        let b = broadcaster();
        b.publish_request_complete(sample_event("r1"));
        b.publish_request_complete(sample_event("r2"));
        let sub = SseBroadcaster::subscribe(&b);
        let recent = sub.init["recentRequests"].as_array().unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1]["requestId"], "r2");
    }

    #[tokio::test]
    async fn recent_ring_is_bounded() {
        let b = broadcaster();
        for i in 0..(RECENT_CAPACITY + 10) {
            b.publish_request_complete(sample_event(&format!("r{i}")));
        }
        let sub = SseBroadcaster::subscribe(&b);
        assert_eq!(sub.init["recentRequests"].as_array().unwrap().len(), RECENT_CAPACITY);
    }

    #[tokio::test]
    async fn pool_status_timer_emits_events() {
        let b = broadcaster();
        let mut sub = SseBroadcaster::subscribe(&b);
        let ev = tokio::time::timeout(Duration::from_millis(500), sub.rx.recv())
            .await
            .expect("timer should emit within 500ms")
            .unwrap();
        assert_eq!(ev.name, "pool-status");
        let v: Value = serde_json::from_str(&ev.data).unwrap();
        assert_eq!(v["schemaVersion"], 1);
        assert!(v["pools"]["heavy"].is_array());
    }
}
