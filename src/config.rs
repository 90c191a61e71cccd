//! Proxy configuration.
//!
//! Every component reads a typed config section. Startup values come from
//! built-in defaults overridden by `GLM_*` environment variables; an invalid
//! numeric or boolean value is ignored with the default retained (and a
//! warning logged), never a startup failure.
//!
//! The routing section ([`RouterConfig`]) is additionally editable at runtime
//! through `PUT /model-routing`; [`RouterConfig::apply_edits`] enforces the
//! editable key set.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Parse an env var, keeping `default` when unset or unparseable.
fn env_parse<T: FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, %default, "invalid env value ignored");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                tracing::warn!(var = name, value = %raw, default, "invalid env value ignored");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

/// Top-level proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Reject request bodies larger than this many bytes.
    pub max_body_size: usize,
    /// Paths short-circuited with 204 (client telemetry uploads).
    pub telemetry_paths: Vec<String>,
    pub admission: AdmissionConfig,
    pub hold: HoldConfig,
    pub circuit: CircuitConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
    pub aimd: AimdSettings,
    pub pool: PoolSettings,
    pub account: AccountSettings,
    pub penalty: PenaltySettings,
    pub upstream: UpstreamConfig,
    pub router: RouterConfig,
    /// Bearer secrets, comma separated in `GLM_KEYS`.
    pub keys: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8321,
            max_body_size: 10 * 1024 * 1024,
            telemetry_paths: vec!["/v1/telemetry".into(), "/api/event_log".into()],
            admission: AdmissionConfig::default(),
            hold: HoldConfig::default(),
            circuit: CircuitConfig::default(),
            schedule: ScheduleConfig::default(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            aimd: AimdSettings::default(),
            pool: PoolSettings::default(),
            account: AccountSettings::default(),
            penalty: PenaltySettings::default(),
            upstream: UpstreamConfig::default(),
            router: RouterConfig::default(),
            keys: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Defaults overridden by `GLM_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.host = env_string("GLM_HOST", &cfg.host);
        cfg.port = env_parse("GLM_PORT", cfg.port);
        cfg.max_body_size = env_parse("GLM_MAX_BODY_SIZE", cfg.max_body_size);
        cfg.keys = std::env::var("GLM_KEYS")
            .map(|raw| {
                raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
            })
            .unwrap_or_default();

        cfg.admission.max_total_concurrency =
            env_parse("GLM_MAX_TOTAL_CONCURRENCY", cfg.admission.max_total_concurrency);
        cfg.admission.queue_capacity = env_parse("GLM_QUEUE_CAPACITY", cfg.admission.queue_capacity);
        cfg.admission.queue_timeout_ms =
            env_parse("GLM_QUEUE_TIMEOUT_MS", cfg.admission.queue_timeout_ms);

        cfg.retry.max_retries = env_parse("GLM_MAX_RETRIES", cfg.retry.max_retries);
        cfg.retry.max_429_retry_window_ms =
            env_parse("GLM_MAX_429_RETRY_WINDOW_MS", cfg.retry.max_429_retry_window_ms);
        cfg.retry.base_delay_ms = env_parse("GLM_RETRY_BASE_DELAY_MS", cfg.retry.base_delay_ms);

        cfg.timeout.request_timeout_ms =
            env_parse("GLM_REQUEST_TIMEOUT_MS", cfg.timeout.request_timeout_ms);

        cfg.upstream.base_url = env_string("GLM_UPSTREAM_URL", &cfg.upstream.base_url);
        cfg.upstream.send_x_api_key = env_bool("GLM_SEND_X_API_KEY", cfg.upstream.send_x_api_key);

        cfg.aimd.enforce = env_bool("GLM_AIMD_ENFORCE", cfg.aimd.enforce);
        cfg.router.trace.sampling_rate =
            env_parse("GLM_TRACE_SAMPLING_RATE", cfg.router.trace.sampling_rate);
        cfg.router.overrides_file = env_string("GLM_OVERRIDES_FILE", &cfg.router.overrides_file);
        cfg
    }
}

/// Backpressure gate settings.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Ceiling on the sum of per-key in-flight requests.
    pub max_total_concurrency: usize,
    /// Waiters allowed in the admission queue before immediate 503.
    pub queue_capacity: usize,
    pub queue_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { max_total_concurrency: 128, queue_capacity: 256, queue_timeout_ms: 10_000 }
    }
}

/// Tier admission-hold settings.
#[derive(Debug, Clone)]
pub struct HoldConfig {
    pub max_hold_ms: u64,
    pub max_concurrent_holds: usize,
    /// Holds shorter than this are not worth sleeping for.
    pub min_cooldown_to_hold_ms: u64,
    pub jitter_percent: f64,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            max_hold_ms: 8_000,
            max_concurrent_holds: 64,
            min_cooldown_to_hold_ms: 250,
            jitter_percent: 0.10,
        }
    }
}

/// Per-key circuit breaker settings.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: usize,
    pub failure_window_ms: u64,
    pub cooldown_period_ms: u64,
    pub half_open_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            cooldown_period_ms: 30_000,
            half_open_timeout_ms: 15_000,
        }
    }
}

/// Key selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    RoundRobin,
    WeightedHealth,
}

/// Key scheduler settings.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub mode: SelectionMode,
    pub weight_latency: f64,
    pub weight_success: f64,
    pub weight_error_recency: f64,
    pub error_recency_window_ms: u64,
    pub latency_window: usize,
    pub slow_key_check_interval_ms: u64,
    /// Multiplier over the pool-average p50 beyond which a key is slow.
    pub slow_key_threshold: f64,
    pub slow_key_cooldown_ms: u64,
    /// `x-ratelimit-remaining` at or below this triggers pacing.
    pub pacing_remaining_threshold: u64,
    pub pacing_delay_ms: u64,
    pub base_cooldown_ms: u64,
    pub max_key_cooldown_ms: u64,
    /// Quiet time after which a key's cooldown escalation resets.
    pub cooldown_decay_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::WeightedHealth,
            weight_latency: 0.4,
            weight_success: 0.4,
            weight_error_recency: 0.2,
            error_recency_window_ms: 120_000,
            latency_window: 64,
            slow_key_check_interval_ms: 15_000,
            slow_key_threshold: 2.0,
            slow_key_cooldown_ms: 60_000,
            pacing_remaining_threshold: 2,
            pacing_delay_ms: 750,
            base_cooldown_ms: 1_000,
            max_key_cooldown_ms: 120_000,
            cooldown_decay_ms: 300_000,
        }
    }
}

/// Retry orchestration settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    /// Ceiling on model switches within one request.
    pub max_429_attempts_per_request: usize,
    /// Wall-clock budget for the retry loop (hold time excluded).
    pub max_429_retry_window_ms: u64,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Jitter applied as `delay * (1 ± jitter_percent)`.
    pub jitter_percent: f64,
    /// Cap honored when upstream supplies `retry-after`.
    pub max_cooldown_ms: u64,
    /// A 429 whose `retry-after` exceeds this is quota, not congestion.
    pub quota_retry_after_ms: u64,
    /// Whether transient context overflow is retried after a short sleep.
    pub transient_overflow_retry: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            max_429_attempts_per_request: 3,
            max_429_retry_window_ms: 45_000,
            base_delay_ms: 300,
            backoff_multiplier: 2.0,
            max_delay_ms: 8_000,
            jitter_percent: 0.25,
            max_cooldown_ms: 60_000,
            quota_retry_after_ms: 120_000,
            transient_overflow_retry: false,
        }
    }
}

/// Adaptive per-attempt timeout settings.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub initial_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub latency_multiplier: f64,
    pub retry_multiplier: f64,
    pub min_samples: usize,
    /// Hard cap on any single client request.
    pub request_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initial_ms: 60_000,
            min_ms: 10_000,
            max_ms: 300_000,
            latency_multiplier: 3.0,
            retry_multiplier: 1.5,
            min_samples: 8,
            request_timeout_ms: 600_000,
        }
    }
}

/// AIMD growth flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthMode {
    Additive,
    Proportional,
}

/// Per-model adaptive concurrency settings.
#[derive(Debug, Clone)]
pub struct AimdSettings {
    /// `false` = observe-only (compute and log, static limits serve).
    pub enforce: bool,
    pub tick_interval_ms: u64,
    pub min_window: usize,
    pub decrease_factor: f64,
    pub recovery_delay_ms: u64,
    pub growth_clean_ticks: u32,
    pub growth_mode: GrowthMode,
    pub idle_timeout_ms: u64,
    pub idle_decay_step: usize,
    pub min_hold_ms: u64,
    /// 429s with `retry-after` above this are quota events, exempt from decrease.
    pub quota_retry_after_ms: u64,
}

impl Default for AimdSettings {
    fn default() -> Self {
        Self {
            enforce: false,
            tick_interval_ms: 1_000,
            min_window: 1,
            decrease_factor: 0.5,
            recovery_delay_ms: 5_000,
            growth_clean_ticks: 3,
            growth_mode: GrowthMode::Additive,
            idle_timeout_ms: 30_000,
            idle_decay_step: 1,
            min_hold_ms: 2_000,
            quota_retry_after_ms: 120_000,
        }
    }
}

/// Pool-wide cooldown ladder settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// 429s across the pool within `window_ms` that trip the ladder.
    pub trigger_count: usize,
    pub window_ms: u64,
    pub base_cooldown_ms: u64,
    pub cap_ms: u64,
    pub decay_ms: u64,
    /// Cooldowns at or below this are absorbed locally instead of surfaced.
    pub sleep_threshold_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            trigger_count: 6,
            window_ms: 10_000,
            base_cooldown_ms: 1_000,
            cap_ms: 60_000,
            decay_ms: 120_000,
            sleep_threshold_ms: 2_000,
        }
    }
}

/// Account-level 429 detector settings.
#[derive(Debug, Clone)]
pub struct AccountSettings {
    /// Distinct keys that must 429 within `window_ms`.
    pub key_threshold: usize,
    pub window_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self { key_threshold: 3, window_ms: 10_000, cooldown_ms: 30_000 }
    }
}

/// Per-model sliding 429 penalty settings (pool-strategy scoring input).
#[derive(Debug, Clone)]
pub struct PenaltySettings {
    pub window_ms: u64,
    pub weight: f64,
    pub max_penalty_hits: usize,
}

impl Default for PenaltySettings {
    fn default() -> Self {
        Self { window_ms: 60_000, weight: 0.5, max_penalty_hits: 10 }
    }
}

/// Upstream HTTP client settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub messages_path: String,
    pub connect_timeout_ms: u64,
    /// Idle keep-alive socket lifetime.
    pub free_socket_timeout_ms: u64,
    pub max_consecutive_hangups: usize,
    pub agent_recreation_cooldown_ms: u64,
    /// Also send the bearer secret as `x-api-key`.
    pub send_x_api_key: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://open.bigmodel.cn/api/anthropic".into(),
            messages_path: "/v1/messages".into(),
            connect_timeout_ms: 10_000,
            free_socket_timeout_ms: 15_000,
            max_consecutive_hangups: 3,
            agent_recreation_cooldown_ms: 30_000,
            send_x_api_key: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Routing configuration (runtime-editable surface)
// ---------------------------------------------------------------------------

/// How a tier picks among its models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Throughput,
    Balanced,
    Quality,
    Pool,
    Failover,
}

/// Whether client models reach a tier through the classifier or only rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientModelPolicy {
    AlwaysRoute,
    RuleMatchOnly,
}

/// One tier: an ordered candidate list plus a selection strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub name: String,
    pub models: Vec<String>,
    pub strategy: Strategy,
    #[serde(default = "default_client_model_policy")]
    pub client_model_policy: ClientModelPolicy,
}

fn default_client_model_policy() -> ClientModelPolicy {
    ClientModelPolicy::AlwaysRoute
}

/// A routing rule; all present conditions must match (AND).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_glob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_gte: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_tools: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_vision: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count_gte: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_length_gte: Option<usize>,
    pub tier: String,
}

/// Heuristic thresholds for the heavy tier (any matching condition).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeavyThresholds {
    pub max_tokens_gte: u64,
    pub message_count_gte: usize,
    pub system_length_gte: usize,
}

impl Default for HeavyThresholds {
    fn default() -> Self {
        Self { max_tokens_gte: 8_192, message_count_gte: 40, system_length_gte: 8_000 }
    }
}

/// Heuristic ceilings for the light tier (all must hold).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightThresholds {
    pub max_tokens_lte: u64,
    pub message_count_lte: usize,
    pub system_length_lte: usize,
}

impl Default for LightThresholds {
    fn default() -> Self {
        Self { max_tokens_lte: 1_024, message_count_lte: 6, system_length_lte: 1_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierConfig {
    #[serde(default)]
    pub heavy: HeavyThresholds,
    #[serde(default)]
    pub light: LightThresholds,
}

/// Model-cooldown map settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Entries untouched for this long evaporate on next read.
    pub decay_ms: u64,
    pub max_entries: usize,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self { base_ms: 2_000, cap_ms: 120_000, decay_ms: 600_000, max_entries: 64 }
    }
}

/// Failover and tier-downgrade settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    pub allow_tier_downgrade: bool,
    pub downgrade_order: Vec<String>,
    pub max_tier_downgrades_per_request: usize,
    pub max_model_switches_per_request: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            allow_tier_downgrade: false,
            downgrade_order: vec!["medium".into(), "light".into()],
            max_tier_downgrades_per_request: 1,
            max_model_switches_per_request: 3,
        }
    }
}

/// Shadow preference for glm-5 on medium traffic; 0 records without serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Glm5Config {
    pub preference_percent: f64,
}

impl Default for Glm5Config {
    fn default() -> Self {
        Self { preference_percent: 0.0 }
    }
}

/// Medium→heavy upgrade on structurally complex conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityUpgradeConfig {
    pub enabled: bool,
    pub message_count_gte: usize,
    pub system_length_gte: usize,
}

impl Default for ComplexityUpgradeConfig {
    fn default() -> Self {
        Self { enabled: false, message_count_gte: 80, system_length_gte: 16_000 }
    }
}

/// Decision-trace sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceConfig {
    /// Percent of decisions that record a trace, clamped to 0..=100.
    pub sampling_rate: f64,
    pub max_payload_size: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { sampling_rate: 5.0, max_payload_size: 16 * 1024 }
    }
}

/// Routing configuration. The serialized form is the `PUT /model-routing`
/// surface; [`RouterConfig::apply_edits`] decides which keys are writable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    pub enabled: bool,
    pub default_model: Option<String>,
    pub tiers: Vec<TierConfig>,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub log_decisions: bool,
    /// Saved per-key overrides seeded at startup (`"*"` = wildcard).
    #[serde(default)]
    pub overrides: HashMap<String, String>,
    #[serde(default)]
    pub glm5: Glm5Config,
    #[serde(default)]
    pub complexity_upgrade: ComplexityUpgradeConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub shadow_mode: bool,
    // Non-editable at runtime.
    #[serde(default)]
    pub persist_config_edits: bool,
    #[serde(default)]
    pub config_file: Option<String>,
    #[serde(default = "default_overrides_file")]
    pub overrides_file: String,
    #[serde(default = "default_max_overrides")]
    pub max_overrides: usize,
}

fn default_overrides_file() -> String {
    "glm-proxy-overrides.json".into()
}

fn default_max_overrides() -> usize {
    32
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_model: Some("glm-4.7".into()),
            tiers: vec![
                TierConfig {
                    name: "light".into(),
                    models: vec!["glm-4.7-flash".into(), "glm-4.5-air".into()],
                    strategy: Strategy::Throughput,
                    client_model_policy: ClientModelPolicy::AlwaysRoute,
                },
                TierConfig {
                    name: "medium".into(),
                    models: vec!["glm-4.7".into(), "glm-4.6".into()],
                    strategy: Strategy::Pool,
                    client_model_policy: ClientModelPolicy::AlwaysRoute,
                },
                TierConfig {
                    name: "heavy".into(),
                    models: vec!["glm-5".into(), "glm-4.7".into(), "glm-4.6".into()],
                    strategy: Strategy::Quality,
                    client_model_policy: ClientModelPolicy::AlwaysRoute,
                },
            ],
            rules: vec![RouteRule {
                model_glob: Some("claude-3-opus*".into()),
                tier: "heavy".into(),
                ..RouteRule::default()
            }],
            classifier: ClassifierConfig::default(),
            cooldown: CooldownConfig::default(),
            failover: FailoverConfig::default(),
            log_decisions: false,
            overrides: HashMap::new(),
            glm5: Glm5Config::default(),
            complexity_upgrade: ComplexityUpgradeConfig::default(),
            trace: TraceConfig::default(),
            shadow_mode: false,
            persist_config_edits: false,
            config_file: None,
            overrides_file: default_overrides_file(),
            max_overrides: default_max_overrides(),
        }
    }
}

/// Keys writable through `PUT /model-routing`.
pub const EDITABLE_KEYS: &[&str] = &[
    "tiers",
    "rules",
    "classifier",
    "cooldown",
    "failover",
    "defaultModel",
    "logDecisions",
    "overrides",
    "glm5",
    "complexityUpgrade",
    "trace",
    "shadowMode",
];

/// Keys explicitly rejected (present in the serialized form, never writable).
pub const PROTECTED_KEYS: &[&str] =
    &["persistConfigEdits", "configFile", "overridesFile", "maxOverrides"];

/// Rejected runtime edit.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigEditError {
    #[error("key {0:?} is not runtime-editable")]
    NonEditableKey(String),
    #[error("key {0:?} is unknown")]
    UnknownKey(String),
    #[error("edit payload must be a JSON object")]
    NotAnObject,
    #[error("invalid value for {key:?}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl RouterConfig {
    /// Apply a runtime edit, returning the merged config. Non-editable and
    /// unknown keys are rejected outright; nothing is applied partially.
    pub fn apply_edits(&self, patch: &serde_json::Value) -> Result<RouterConfig, ConfigEditError> {
        let obj = patch.as_object().ok_or(ConfigEditError::NotAnObject)?;
        for key in obj.keys() {
            if PROTECTED_KEYS.contains(&key.as_str()) {
                return Err(ConfigEditError::NonEditableKey(key.clone()));
            }
            if !EDITABLE_KEYS.contains(&key.as_str()) {
                return Err(ConfigEditError::UnknownKey(key.clone()));
            }
        }
        let mut merged = serde_json::to_value(self)
            .map_err(|e| ConfigEditError::InvalidValue { key: "<self>".into(), reason: e.to_string() })?;
        if let Some(target) = merged.as_object_mut() {
            for (key, value) in obj {
                target.insert(key.clone(), value.clone());
            }
        }
        let mut next: RouterConfig = serde_json::from_value(merged)
            .map_err(|e| ConfigEditError::InvalidValue { key: "<merge>".into(), reason: e.to_string() })?;
        next.trace.sampling_rate = next.trace.sampling_rate.clamp(0.0, 100.0);
        Ok(next)
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.name == name)
    }
}
