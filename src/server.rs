//! HTTP surface.
//!
//! The proxied `/v1/messages` endpoint plus the operational API: stats,
//! the SSE request stream, the model-routing config surface, and control
//! endpoints. Handlers stay thin; behavior lives in the components.

use crate::aimd::AdaptiveConcurrency;
use crate::admission::{AdmissionGate, AdmissionHold};
use crate::catalog::ModelCatalog;
use crate::circuit::CircuitState;
use crate::clock::{Clock, MonotonicClock};
use crate::config::ProxyConfig;
use crate::events::SseBroadcaster;
use crate::executor::Pipeline;
use crate::keys::KeyStore;
use crate::pool::{AccountLimitDetector, PoolCooldown, Penalty429};
use crate::retry::RetryOrchestrator;
use crate::router::classify::{classify, RequestFeatures};
use crate::router::ModelRouter;
use crate::sched::KeyScheduler;
use crate::sleeper::TokioSleeper;
use crate::stats::StatsAggregator;
use crate::timeout::AdaptiveTimeout;
use crate::upstream::UpstreamClient;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Shared application state: the pipeline plus the handles the API needs
/// directly.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<KeyStore>,
    pub catalog: Arc<ModelCatalog>,
    pub aimd: Arc<AdaptiveConcurrency>,
}

impl AppState {
    /// Wire every component from a config.
    pub fn build(config: ProxyConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let catalog = Arc::new(ModelCatalog::builtin());
        let store = Arc::new(KeyStore::new(config.keys.clone()));
        let scheduler = Arc::new(KeyScheduler::new(
            store.clone(),
            config.schedule.clone(),
            config.circuit.clone(),
            clock.clone(),
        ));
        let penalty = Arc::new(Penalty429::new(config.penalty.clone(), clock.clone()));
        let aimd = Arc::new(AdaptiveConcurrency::new(config.aimd.clone(), clock.clone()));
        let router = Arc::new(ModelRouter::new(
            config.router.clone(),
            catalog.clone(),
            penalty,
            aimd.clone(),
            clock.clone(),
        ));
        let broadcaster = Arc::new(SseBroadcaster::new(router.clone(), Duration::from_secs(3)));
        let pipeline = Arc::new(Pipeline {
            gate: Arc::new(AdmissionGate::new(&config.admission)),
            hold: Arc::new(AdmissionHold::new(config.hold.clone(), Arc::new(TokioSleeper))),
            retryer: Arc::new(RetryOrchestrator::new(config.retry.clone())),
            timeouts: Arc::new(AdaptiveTimeout::new(config.timeout.clone())),
            upstream: Arc::new(UpstreamClient::new(config.upstream.clone(), clock.clone())),
            pool: Arc::new(PoolCooldown::new(config.pool.clone(), clock.clone())),
            account: Arc::new(AccountLimitDetector::new(config.account.clone(), clock.clone())),
            broadcaster,
            stats: Arc::new(StatsAggregator::new()),
            sleeper: Arc::new(TokioSleeper),
            scheduler,
            router,
            clock,
            config: Arc::new(config),
        });
        Self { pipeline, store, catalog, aimd }
    }

    /// Background tasks (the AIMD ticker). Call once from a runtime.
    pub fn spawn_background(&self) {
        let _ = self.aimd.clone().spawn_ticker();
    }
}

pub fn app(state: AppState) -> Router {
    let body_limit = state.pipeline.config.max_body_size.saturating_add(4 * 1024);
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .route("/requests/stream", get(requests_stream))
        .route("/model-routing", get(routing_get).put(routing_put))
        .route("/model-routing/explain", post(routing_explain))
        .route("/model-routing/test", get(routing_test))
        .route("/model-routing/counters", get(routing_counters))
        .route("/control/:action", post(control))
        .route("/control/circuit/:idx/:state", post(control_circuit))
        .route("/api/circuit/:idx", post(api_circuit))
        .route("/reload", post(reload))
        .fallback(fallback)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn messages(State(app): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    app.pipeline.execute("/v1/messages", &headers, body).await
}

async fn healthz(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptimeMs": app.pipeline.stats.snapshot()["uptimeMs"],
        "keys": app.store.len(),
    }))
}

async fn stats(State(app): State<AppState>) -> Json<Value> {
    let p = &app.pipeline;
    Json(json!({
        "proxy": p.stats.snapshot(),
        "keys": p.scheduler.snapshots(),
        "pools": p.router.pool_status(),
        "admission": {
            "inUse": p.gate.in_use(),
            "max": p.gate.max(),
            "waiting": p.gate.waiting(),
            "paused": p.gate.is_paused(),
        },
        "poolCooldownMs": p.pool.remaining().map(|d| d.as_millis() as u64),
        "accountCooldownMs": p.account.remaining().map(|d| d.as_millis() as u64),
        "aimd": app.aimd.snapshot(),
    }))
}

async fn requests_stream(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = SseBroadcaster::subscribe(&app.pipeline.broadcaster);
    let init = Event::default().event("init").data(subscription.init.to_string());
    let live = futures::stream::unfold(subscription, |mut subscription| async move {
        loop {
            match subscription.rx.recv().await {
                Ok(ev) => {
                    let event = Event::default().event(ev.name).data(ev.data);
                    return Some((Ok(event), subscription));
                }
                // A slow dashboard skips missed events rather than dying.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });
    let stream = futures::stream::once(async move { Ok(init) }).chain(live);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn routing_get(State(app): State<AppState>) -> Json<Value> {
    let router = &app.pipeline.router;
    let config = router.config();
    Json(json!({
        "enabled": config.enabled,
        "config": &*config,
        "stats": router.stats(),
    }))
}

async fn routing_put(State(app): State<AppState>, Json(patch): Json<Value>) -> Response {
    let router = &app.pipeline.router;
    let current = router.config();
    match current.apply_edits(&patch) {
        Ok(next) => {
            let replace_overrides =
                patch.as_object().is_some_and(|o| o.contains_key("overrides"));
            router.set_config(next, replace_overrides);
            tracing::info!("routing config updated");
            Json(json!({ "ok": true, "config": &*router.config() })).into_response()
        }
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn routing_explain(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    let features = RequestFeatures::from_body(&body);
    match app.pipeline.router.explain(&features, body.get("messages")) {
        Some(decision) => Json(json!({ "decision": decision, "features": features })).into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no routing decision possible" })),
        )
            .into_response(),
    }
}

async fn routing_test(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let features = RequestFeatures {
        client_model: params.get("model").cloned(),
        max_tokens: params.get("max_tokens").and_then(|v| v.parse().ok()).unwrap_or(0),
        message_count: params.get("messages").and_then(|v| v.parse().ok()).unwrap_or(0),
        system_length: params.get("system_length").and_then(|v| v.parse().ok()).unwrap_or(0),
        has_tools: params.get("has_tools").is_some_and(|v| v == "true" || v == "1"),
        has_vision: params.get("has_vision").is_some_and(|v| v == "true" || v == "1"),
        ..RequestFeatures::default()
    };
    let config = app.pipeline.router.config();
    let classified = classify(&config, &features);
    Json(json!({
        "features": features,
        "tier": classified.map(|(tier, _)| tier),
        "source": classified.map(|(_, source)| format!("{source:?}").to_lowercase()),
    }))
}

async fn routing_counters(State(app): State<AppState>) -> Json<Value> {
    Json(app.pipeline.stats.counters_registry())
}

async fn control(State(app): State<AppState>, Path(action): Path<String>) -> Response {
    let p = &app.pipeline;
    match action.as_str() {
        "pause" => {
            p.gate.pause();
            ok()
        }
        "resume" => {
            p.gate.resume();
            ok()
        }
        "reset" => {
            p.router.reset();
            p.scheduler.rebuild();
            p.pool.reset();
            p.account.reset();
            p.stats.reset();
            p.broadcaster.clear_recent();
            tracing::info!("full state reset");
            ok()
        }
        "clear-logs" => {
            p.broadcaster.clear_recent();
            ok()
        }
        "reset-stats" => {
            p.stats.reset();
            ok()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": format!("unknown control action {action:?}") })),
        )
            .into_response(),
    }
}

async fn control_circuit(
    State(app): State<AppState>,
    Path((idx, state)): Path<(usize, String)>,
) -> Response {
    force_circuit(&app, idx, &state)
}

async fn api_circuit(
    State(app): State<AppState>,
    Path(idx): Path<usize>,
    Json(body): Json<Value>,
) -> Response {
    let Some(state) = body.get("state").and_then(|v| v.as_str()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": "missing state field" })),
        )
            .into_response();
    };
    force_circuit(&app, idx, state)
}

fn force_circuit(app: &AppState, idx: usize, state: &str) -> Response {
    let Some(key_state) = app.pipeline.scheduler.state(idx) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": format!("no key at index {idx}") })),
        )
            .into_response();
    };
    match state.parse::<CircuitState>() {
        Ok(target) => {
            key_state.circuit.force(target);
            Json(json!({ "ok": true, "circuit": key_state.circuit.snapshot() })).into_response()
        }
        Err(err) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "error": err }))).into_response()
        }
    }
}

async fn reload(State(app): State<AppState>) -> Json<Value> {
    let keys: Vec<String> = std::env::var("GLM_KEYS")
        .map(|raw| {
            raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
        })
        .unwrap_or_default();
    let count = if keys.is_empty() { app.store.len() } else { app.store.reload(keys) };
    app.pipeline.scheduler.rebuild();
    Json(json!({ "ok": true, "keys": count }))
}

async fn fallback(State(app): State<AppState>, uri: Uri) -> Response {
    // Client telemetry uploads are acknowledged and dropped.
    if app.pipeline.config.telemetry_paths.iter().any(|p| p == uri.path()) {
        return StatusCode::NO_CONTENT.into_response();
    }
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("no route for {}", uri.path()) })),
    )
        .into_response()
}

fn ok() -> Response {
    Json(json!({ "ok": true })).into_response()
}
