#![forbid(unsafe_code)]

//! # glm-proxy
//!
//! Capacity-aware reverse proxy for GLM chat endpoints. Clients speak the
//! messages dialect; the proxy routes each request to a provider model,
//! schedules it onto one of a pool of bearer keys, and shields callers
//! from transient upstream failures.
//!
//! ## Architecture
//!
//! - **Request pipeline** ([`executor`]): admission, routing, the attempt
//!   loop with retry orchestration, response relay.
//! - **Model router** ([`router`]): tier classification, strategy-based
//!   candidate selection with atomic slot acquisition, cooldowns, context
//!   window guarding, tier downgrade, decision traces.
//! - **Capacity fabric** ([`circuit`], [`aimd`], [`pool`], [`sched`]):
//!   per-key circuit breakers and health scoring, AIMD concurrency
//!   windows, pool/account cooldowns, sliding 429 penalties.
//! - **Observability** ([`events`], [`stats`]): live SSE pool status and
//!   request lifecycle events, in-memory KPI counters.
//!
//! The library exposes every component so they can be exercised in
//! isolation; the binary in `main.rs` wires them behind the HTTP surface
//! in [`server`].

pub mod admission;
pub mod aimd;
pub mod catalog;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod keys;
pub mod pool;
pub mod retry;
pub mod router;
pub mod sched;
pub mod server;
pub mod sleeper;
pub mod stats;
pub mod timeout;
pub mod upstream;

// Re-exports
pub use admission::{AdmissionError, AdmissionGate, AdmissionHold, HoldOutcome};
pub use aimd::AdaptiveConcurrency;
pub use catalog::{ModelCatalog, ModelDescriptor};
pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ProxyConfig, RouterConfig, Strategy, TierConfig};
pub use error::{ErrorEnvelope, ProxyError};
pub use events::{RequestCompleteEvent, SseBroadcaster};
pub use executor::Pipeline;
pub use keys::{Key, KeyStore};
pub use pool::{AccountLimitDetector, Penalty429, PoolCooldown};
pub use retry::{AttemptOutcome, LoopProgress, RetryAction, RetryOrchestrator};
pub use router::classify::RequestFeatures;
pub use router::{Decision, DecisionSource, ModelRouter, OverflowCause, SelectionRequest};
pub use sched::{KeyScheduler, KeyState, LatencyWindow};
pub use server::{app, AppState};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stats::StatsAggregator;
pub use timeout::AdaptiveTimeout;
pub use upstream::{UpstreamClient, UpstreamError, UpstreamResponse};
