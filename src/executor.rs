//! Front-door request pipeline.
//!
//! One call to [`Pipeline::execute`] carries a client request end to end:
//! admission, pool-cooldown absorption, routing (with admission holds),
//! the attempt loop against upstream, and finally streaming or buffering
//! the winning response back. Exactly one `request-complete` event is
//! published per request, on success and failure alike, and every slot or
//! counter taken along the way is released on all exit paths.

use crate::admission::{AdmissionError, AdmissionGate, AdmissionHold, AdmissionPermit, HoldOutcome};
use crate::clock::{epoch_millis, Clock};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::events::{RequestCompleteEvent, SseBroadcaster};
use crate::pool::{AccountLimitDetector, PoolCooldown};
use crate::retry::{AttemptOutcome, GiveUpReason, LoopProgress, RetryAction, RetryOrchestrator};
use crate::router::classify::RequestFeatures;
use crate::router::{Decision, ModelRouter, OverflowCause, SelectionRequest};
use crate::sched::{KeyScheduler, KeyState};
use crate::sleeper::Sleeper;
use crate::stats::StatsAggregator;
use crate::timeout::AdaptiveTimeout;
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamResponse};
use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Header clients use to pin the provider model for one request.
pub const MODEL_OVERRIDE_HEADER: &str = "x-model-override";

/// Everything one request execution needs, shared across requests.
pub struct Pipeline {
    pub config: Arc<ProxyConfig>,
    pub scheduler: Arc<KeyScheduler>,
    pub router: Arc<ModelRouter>,
    pub gate: Arc<AdmissionGate>,
    pub hold: Arc<AdmissionHold>,
    pub retryer: Arc<RetryOrchestrator>,
    pub timeouts: Arc<AdaptiveTimeout>,
    pub upstream: Arc<UpstreamClient>,
    pub pool: Arc<PoolCooldown>,
    pub account: Arc<AccountLimitDetector>,
    pub broadcaster: Arc<SseBroadcaster>,
    pub stats: Arc<StatsAggregator>,
    pub sleeper: Arc<dyn Sleeper>,
    pub clock: Arc<dyn Clock>,
}

/// The winning attempt, ready to forward.
struct SuccessAttempt {
    upstream: UpstreamResponse,
    decision: Decision,
    key_state: Arc<KeyState>,
    latency_ms: u64,
}

impl Pipeline {
    pub async fn execute(&self, path: &str, headers: &HeaderMap, body: Bytes) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let started = self.clock.now_millis();

        if body.len() > self.config.max_body_size {
            return self.respond_error(
                ProxyError::RequestTooLarge { max: self.config.max_body_size },
                &request_id,
                path,
                None,
                started,
            );
        }
        let parsed: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(err) => {
                return self.respond_error(
                    ProxyError::MalformedBody { reason: err.to_string() },
                    &request_id,
                    path,
                    None,
                    started,
                )
            }
        };
        let features = RequestFeatures::from_body(&parsed);

        let permit = match self.gate.admit().await {
            Ok(permit) => permit,
            Err(err) => {
                self.stats.record_admission_reject();
                let mapped = match err {
                    AdmissionError::QueueFull { .. } | AdmissionError::Paused => {
                        ProxyError::Backpressure {
                            in_flight: self.gate.in_use(),
                            max: self.gate.max(),
                        }
                    }
                    AdmissionError::Timeout { waited } => ProxyError::QueueTimeout { waited },
                };
                return self.respond_error(mapped, &request_id, path, None, started);
            }
        };
        self.stats.record_admitted();

        // Pool-wide cooldown: absorb short waits, surface long ones.
        if let Some(remaining) = self.pool.remaining() {
            if self.pool.should_absorb(remaining) {
                self.sleeper.sleep(remaining).await;
            } else {
                return self.respond_error(
                    ProxyError::PoolCooldown { retry_after: remaining },
                    &request_id,
                    path,
                    None,
                    started,
                );
            }
        }

        let header_override =
            headers.get(MODEL_OVERRIDE_HEADER).and_then(|v| v.to_str().ok()).map(String::from);

        let mut attempted_models: HashSet<String> = HashSet::new();
        let mut hold_excluded_ms = 0u64;
        let mut held_once = false;

        // Routing, with at most one admission hold before re-selection.
        let decision = loop {
            let selection = SelectionRequest {
                features: &features,
                messages: parsed.get("messages"),
                attempted_models: &attempted_models,
                header_override: header_override.as_deref(),
                bypass_trace_sampling: false,
                failover: false,
                downgrades_used: 0,
            };
            let decision = match self.router.select_model(&selection) {
                Some(d) => d,
                // Shadow mode (or an unroutable request with a default
                // model) still serves through the default fallback.
                None => match self.router.fallback_default() {
                    Some(d) => d,
                    None => {
                        return self.respond_error(
                            ProxyError::Unroutable { client_model: features.client_model.clone() },
                            &request_id,
                            path,
                            None,
                            started,
                        )
                    }
                },
            };

            if let Some(overflow) = &decision.context_overflow {
                let err = match overflow.cause {
                    OverflowCause::Genuine => {
                        ProxyError::ContextOverflowGenuine { estimated: overflow.estimated_tokens }
                    }
                    OverflowCause::TransientUnavailable => ProxyError::ContextOverflowTransient {
                        retry_after: self
                            .router
                            .tier_cooldown(&decision.tier)
                            .unwrap_or(Duration::from_secs(1)),
                    },
                };
                return self.respond_error(err, &request_id, path, Some(&decision), started);
            }

            if decision.best_effort && !held_once {
                if let Some(cooldown) = self.router.tier_cooldown(&decision.tier) {
                    if cooldown.as_millis() as u64 > self.config.hold.min_cooldown_to_hold_ms {
                        held_once = true;
                        self.router.release_model(&decision.model);
                        match self.hold.hold(cooldown).await {
                            HoldOutcome::Held(waited) => {
                                hold_excluded_ms = waited.as_millis() as u64;
                                continue;
                            }
                            HoldOutcome::OverCapacity => {
                                return self.respond_error(
                                    ProxyError::HoldCapacity,
                                    &request_id,
                                    path,
                                    Some(&decision),
                                    started,
                                )
                            }
                            HoldOutcome::NotWorthHolding => continue,
                        }
                    }
                }
            }
            break decision;
        };

        let attempt_result = tokio::time::timeout(
            self.timeouts.request_timeout(),
            self.attempt_loop(&parsed, &features, decision, &mut attempted_models, hold_excluded_ms),
        )
        .await;

        match attempt_result {
            Ok(Ok(success)) => {
                self.forward_response(success, permit, path, &request_id, started).await
            }
            Ok(Err((err, decision))) => {
                self.respond_error(err, &request_id, path, decision.as_ref(), started)
            }
            Err(_) => self.respond_error(
                ProxyError::AttemptsExhausted {
                    attempts: self.retryer.config().max_retries,
                    last: "request deadline exceeded".into(),
                    retry_after: None,
                },
                &request_id,
                path,
                None,
                started,
            ),
        }
    }

    /// Drive attempts until success or a terminal error. The model slot and
    /// per-key counters ride in drop guards, so a cancelled future (client
    /// disconnect, request deadline) releases everything it held.
    async fn attempt_loop(
        &self,
        parsed: &Value,
        features: &RequestFeatures,
        mut decision: Decision,
        attempted_models: &mut HashSet<String>,
        hold_excluded_ms: u64,
    ) -> Result<SuccessAttempt, (ProxyError, Option<Decision>)> {
        let sched_cfg = self.scheduler.config().clone();
        let mut attempted_keys: HashSet<usize> = HashSet::new();
        let mut attempts = 0usize;
        let mut model_switches = 0usize;
        let retry_start = self.clock.now_millis();
        let mut slot = SlotGuard::new(self.router.clone(), decision.model.clone());

        loop {
            let Some(scheduled) = self.scheduler.next(&attempted_keys, false) else {
                let retry_after = self
                    .pool
                    .remaining()
                    .or_else(|| self.account.remaining())
                    .or(Some(Duration::from_secs(1)));
                return Err((ProxyError::NoKeysAvailable { retry_after }, Some(decision)));
            };
            if let Some(pace) = scheduled.pace_for {
                self.sleeper.sleep(pace).await;
            }

            attempts += 1;
            let attempt_timeout = self.timeouts.attempt_timeout(
                scheduled.state.latency_percentile(95.0),
                scheduled.state.latency_samples(),
                attempts.saturating_sub(1),
            );
            let mut key_attempt = KeyAttemptGuard::new(scheduled.state.clone());
            self.router.note_traffic(&decision.model);

            let body = substitute_model(parsed, &decision.model);
            let attempt_started = self.clock.now_millis();
            let sent = self
                .upstream
                .send(&scheduled.key, body, attempt_timeout, features.stream)
                .await;
            let now = self.clock.now_millis();
            let latency_ms = now.saturating_sub(attempt_started);

            let outcome = match &sent {
                Ok(resp) => AttemptOutcome::from_status(
                    resp.status,
                    resp.retry_after.map(|d| d.as_millis() as u64),
                ),
                Err(UpstreamError::Timeout) => AttemptOutcome::Timeout,
                Err(UpstreamError::Connect(_)) | Err(UpstreamError::Hangup(_)) => {
                    AttemptOutcome::SocketHangup
                }
            };
            tracing::debug!(
                attempt = attempts,
                key = scheduled.key.index,
                model = %decision.model,
                outcome = outcome.label(),
                latency_ms,
                "upstream attempt finished"
            );

            if let AttemptOutcome::Success { .. } = outcome {
                scheduled.state.record_success();
                scheduled.state.record_latency(latency_ms);
                scheduled.state.circuit.on_success();
                // `sent` is known-Ok on this branch.
                let Ok(resp) = sent else { unreachable!("success outcome from Err") };
                if resp.ratelimit_remaining.is_some_and(|r| r <= sched_cfg.pacing_remaining_threshold)
                {
                    scheduled.state.note_low_remaining(now, &sched_cfg);
                }
                // The completion guard takes over both releases.
                slot.disarm();
                key_attempt.disarm();
                return Ok(SuccessAttempt {
                    upstream: resp,
                    decision,
                    key_state: scheduled.state,
                    latency_ms,
                });
            }

            // Failure bookkeeping before deciding the next step.
            key_attempt.finish();
            match &outcome {
                AttemptOutcome::RateLimited { retry_after_ms } => {
                    scheduled.state.record_latency(latency_ms);
                    let retry_after = retry_after_ms.map(Duration::from_millis);
                    scheduled.state.note_rate_limited(now, retry_after, &sched_cfg);
                    let pool_tripped = self.pool.record_429().is_some();
                    self.router.record_429(&decision.model, retry_after);
                    self.router.record_model_cooldown(&decision.model, retry_after, pool_tripped);
                    if let Some(until) = self.account.record_429(scheduled.key.index) {
                        self.scheduler.set_account_cooldown(until);
                    }
                }
                // 5xx, timeouts, and hangups climb the same per-key cooldown
                // ladder as 429s; the circuit breaker runs alongside it.
                AttemptOutcome::ServerError { .. } | AttemptOutcome::Timeout => {
                    scheduled.state.record_error(now);
                    scheduled.state.circuit.on_failure();
                    scheduled.state.escalate_cooldown(now, None, &sched_cfg);
                }
                AttemptOutcome::SocketHangup => {
                    let hangups = scheduled.state.record_hangup(now);
                    scheduled.state.circuit.on_failure();
                    self.upstream.maybe_recreate(hangups);
                    scheduled.state.escalate_cooldown(now, None, &sched_cfg);
                }
                AttemptOutcome::AuthFailed { .. } => {
                    scheduled.state.record_error(now);
                    scheduled.state.circuit.on_failure();
                }
                AttemptOutcome::ClientError { .. } | AttemptOutcome::Success { .. } => {}
            }

            let progress = LoopProgress {
                attempts,
                model_switches,
                elapsed_ms: now.saturating_sub(retry_start).saturating_sub(hold_excluded_ms),
            };
            match self.retryer.decide(&outcome, &progress) {
                RetryAction::Succeed => unreachable!("success handled above"),
                RetryAction::GiveUp(reason) => {
                    let err = map_give_up(reason, attempts, &outcome);
                    return Err((err, Some(decision)));
                }
                RetryAction::RetrySwitchKey { delay } => {
                    attempted_keys.insert(scheduled.key.index);
                    self.stats.record_retry();
                    self.sleeper.sleep(delay).await;
                }
                RetryAction::RetrySwitchModel { delay, exclude_key } => {
                    if exclude_key {
                        attempted_keys.insert(scheduled.key.index);
                    }
                    attempted_models.insert(decision.model.clone());
                    slot.release();
                    self.stats.record_retry();
                    self.sleeper.sleep(delay).await;

                    match self.reselect(features, parsed, attempted_models) {
                        Some(next) => {
                            if next.model != decision.model {
                                model_switches += 1;
                                self.stats.record_model_switch();
                            }
                            slot.rearm(next.model.clone());
                            decision = next;
                        }
                        None => {
                            // No alternative model: allow the same one again
                            // and rotate keys instead.
                            attempted_models.remove(&decision.model);
                            match self.reselect(features, parsed, attempted_models) {
                                Some(next) => {
                                    slot.rearm(next.model.clone());
                                    decision = next;
                                }
                                None => {
                                    return Err((
                                        ProxyError::AttemptsExhausted {
                                            attempts,
                                            last: outcome.label().into(),
                                            retry_after: self.pool.remaining(),
                                        },
                                        Some(decision),
                                    ))
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Committed re-selection for a mid-request model switch.
    fn reselect(
        &self,
        features: &RequestFeatures,
        parsed: &Value,
        attempted_models: &HashSet<String>,
    ) -> Option<Decision> {
        let selection = SelectionRequest {
            features,
            messages: parsed.get("messages"),
            attempted_models,
            header_override: None,
            bypass_trace_sampling: false,
            failover: true,
            downgrades_used: 0,
        };
        self.router.select_model(&selection).filter(|d| d.committed)
    }

    /// Forward the winning upstream response, buffered or streamed. The
    /// completion guard releases the model slot and key counter and
    /// publishes the lifecycle event when the body is done (or the client
    /// walks away).
    async fn forward_response(
        &self,
        success: SuccessAttempt,
        permit: AdmissionPermit,
        path: &str,
        request_id: &str,
        _started: u64,
    ) -> Response {
        let SuccessAttempt { upstream, decision, key_state, latency_ms } = success;
        let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
        let event = RequestCompleteEvent {
            path: path.to_string(),
            timestamp: epoch_millis(),
            request_id: request_id.to_string(),
            model: decision.model.clone(),
            tier: decision.tier.clone(),
            strategy: format!("{:?}", decision.strategy).to_lowercase(),
            latency_ms,
            success: true,
            status: upstream.status,
            trace: decision.trace.clone(),
        };
        let mut guard = CompletionGuard {
            router: self.router.clone(),
            model: decision.model.clone(),
            key_state,
            broadcaster: self.broadcaster.clone(),
            stats: self.stats.clone(),
            event,
            _permit: permit,
        };

        let wire_request_id =
            upstream.request_id.clone().unwrap_or_else(|| request_id.to_string());
        let streaming = upstream
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let mut builder = Response::builder()
            .status(status)
            .header("x-request-id", wire_request_id);
        if let Some(ct) = &upstream.content_type {
            builder = builder.header(header::CONTENT_TYPE, ct.as_str());
        }

        if streaming {
            // The guard rides inside the stream closure: finishing the
            // relay or a client disconnect both release on drop.
            let stream = upstream.response.bytes_stream().map(move |chunk| {
                let _keepalive = &guard;
                chunk
            });
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        } else {
            match upstream.response.bytes().await {
                Ok(bytes) => builder
                    .body(Body::from(bytes))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
                Err(err) => {
                    tracing::warn!(%err, "upstream body read failed after success status");
                    guard.event.success = false;
                    guard.event.status = 502;
                    drop(guard);
                    let err = ProxyError::AttemptsExhausted {
                        attempts: 1,
                        last: "upstream dropped mid-body".into(),
                        retry_after: None,
                    };
                    error_response(&err, request_id)
                }
            }
        }
    }

    fn respond_error(
        &self,
        err: ProxyError,
        request_id: &str,
        path: &str,
        decision: Option<&Decision>,
        started: u64,
    ) -> Response {
        self.stats.record_failure(err.error_type());
        self.broadcaster.publish_request_complete(RequestCompleteEvent {
            path: path.to_string(),
            timestamp: epoch_millis(),
            request_id: request_id.to_string(),
            model: decision.map(|d| d.model.clone()).unwrap_or_default(),
            tier: decision.map(|d| d.tier.clone()).unwrap_or_default(),
            strategy: decision
                .map(|d| format!("{:?}", d.strategy).to_lowercase())
                .unwrap_or_default(),
            latency_ms: self.clock.now_millis().saturating_sub(started),
            success: false,
            status: err.status_code(),
            trace: decision.and_then(|d| d.trace.clone()),
        });
        tracing::warn!(
            request_id,
            error_type = err.error_type(),
            status = err.status_code(),
            "request failed: {err}"
        );
        error_response(&err, request_id)
    }
}

/// Releases a held model slot unless disarmed; survives future
/// cancellation inside the attempt loop.
struct SlotGuard {
    router: Arc<ModelRouter>,
    model: String,
    armed: bool,
}

impl SlotGuard {
    fn new(router: Arc<ModelRouter>, model: String) -> Self {
        Self { router, model, armed: true }
    }

    fn release(&mut self) {
        if self.armed {
            self.router.release_model(&self.model);
            self.armed = false;
        }
    }

    fn rearm(&mut self, model: String) {
        self.release();
        self.model = model;
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Pairs `begin_attempt` with a guaranteed `end_attempt`.
struct KeyAttemptGuard {
    state: Arc<KeyState>,
    armed: bool,
}

impl KeyAttemptGuard {
    fn new(state: Arc<KeyState>) -> Self {
        state.begin_attempt();
        Self { state, armed: true }
    }

    fn finish(&mut self) {
        if self.armed {
            self.state.end_attempt();
            self.armed = false;
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for KeyAttemptGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Releases everything a successful attempt holds, exactly once, when the
/// response body is fully relayed or abandoned.
struct CompletionGuard {
    router: Arc<ModelRouter>,
    model: String,
    key_state: Arc<KeyState>,
    broadcaster: Arc<SseBroadcaster>,
    stats: Arc<StatsAggregator>,
    event: RequestCompleteEvent,
    _permit: AdmissionPermit,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.router.release_model(&self.model);
        self.key_state.end_attempt();
        if self.event.success {
            self.stats.record_success(self.event.latency_ms);
        }
        self.broadcaster.publish_request_complete(self.event.clone());
    }
}

/// Serialize the client body with the provider model substituted in.
fn substitute_model(parsed: &Value, model: &str) -> Bytes {
    let mut body = parsed.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".into(), Value::String(model.to_string()));
    }
    Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
}

fn map_give_up(reason: GiveUpReason, attempts: usize, outcome: &AttemptOutcome) -> ProxyError {
    match reason {
        GiveUpReason::ClientError { status } => match outcome {
            AttemptOutcome::ClientError { .. } => ProxyError::MalformedBody {
                reason: format!("upstream rejected request with status {status}"),
            },
            _ => ProxyError::AttemptsExhausted {
                attempts,
                last: outcome.label().into(),
                retry_after: None,
            },
        },
        GiveUpReason::AuthFailed { status } => ProxyError::AuthFailed { status },
        GiveUpReason::Quota { retry_after_ms } => ProxyError::QuotaExhausted {
            retry_after: Some(Duration::from_millis(retry_after_ms)),
        },
        GiveUpReason::AttemptsExhausted
        | GiveUpReason::ModelSwitchBudgetExhausted
        | GiveUpReason::RetryWindowExhausted => ProxyError::AttemptsExhausted {
            attempts,
            last: outcome.label().into(),
            retry_after: match outcome {
                AttemptOutcome::RateLimited { retry_after_ms } => {
                    retry_after_ms.map(Duration::from_millis).or(Some(Duration::from_secs(1)))
                }
                _ => Some(Duration::from_secs(1)),
            },
        },
    }
}

/// Error envelope response shared by the executor and the server surface.
pub fn error_response(err: &ProxyError, request_id: &str) -> Response {
    let envelope = err.envelope(request_id);
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(retry_after) = err.retry_after() {
        builder = builder.header(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string());
    }
    builder
        .body(Body::from(serde_json::to_vec(&envelope).unwrap_or_default()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
