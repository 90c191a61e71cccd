//! Model routing.
//!
//! `select_model` turns parsed request features into a routing decision:
//! which provider model serves the request, under which tier and strategy,
//! and why. Selection and slot acquisition are one atomic step — a returned
//! decision with `committed = true` has already incremented the model's
//! in-flight counter, so concurrent selections can never oversubscribe a
//! ceiling. Context-window guarding, cooldown bookkeeping, saved overrides,
//! tier downgrade (with an always-on shadow), and decision tracing all live
//! here.

pub mod classify;
pub mod cooldown;
pub mod overrides;
pub mod strategy;
pub mod trace;

use crate::aimd::AdaptiveConcurrency;
use crate::catalog::ModelCatalog;
use crate::clock::Clock;
use crate::config::{RouterConfig, Strategy, TierConfig};
use crate::pool::Penalty429;
use arc_swap::ArcSwap;
use self::classify::{ClassifySource, RequestFeatures};
use self::cooldown::CooldownMap;
use self::overrides::{OverrideError, OverrideStore};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use self::strategy::Candidate;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the winning model was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecisionSource {
    #[serde(rename = "override")]
    Override,
    #[serde(rename = "saved-override")]
    SavedOverride,
    #[serde(rename = "rule")]
    Rule,
    #[serde(rename = "classifier")]
    Classifier,
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "pool")]
    Pool,
    #[serde(rename = "failover")]
    Failover,
    #[serde(rename = "tier_downgrade")]
    TierDowngrade,
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverflowCause {
    #[serde(rename = "genuine")]
    Genuine,
    #[serde(rename = "transient_unavailable")]
    TransientUnavailable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOverflow {
    pub cause: OverflowCause,
    pub estimated_tokens: usize,
}

/// One routing decision. `committed` means the model slot is held and must
/// be released through [`ModelRouter::release_model`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub model: String,
    pub tier: String,
    pub source: DecisionSource,
    pub reason: String,
    pub strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_overflow: Option<ContextOverflow>,
    pub committed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_from_tier: Option<String>,
    pub attempted_models: Vec<String>,
    /// Set when every candidate was cooling and the least-cooled one was
    /// taken anyway; the executor may trade this for an admission hold.
    #[serde(skip)]
    pub best_effort: bool,
}

/// Recorded effect of a tier downgrade that did (or would) happen.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DowngradeShadow {
    pub from_tier: String,
    pub would_use_tier: String,
    pub would_use_model: Option<String>,
    pub at_millis: u64,
}

/// Inputs for one selection.
pub struct SelectionRequest<'a> {
    pub features: &'a RequestFeatures,
    /// Raw `messages` value for trace payloads.
    pub messages: Option<&'a Value>,
    pub attempted_models: &'a HashSet<String>,
    /// Per-request header override, highest precedence.
    pub header_override: Option<&'a str>,
    pub bypass_trace_sampling: bool,
    /// Mid-request model switch (decision source becomes `failover`).
    pub failover: bool,
    /// Tier downgrades already consumed by this request.
    pub downgrades_used: usize,
}

impl<'a> SelectionRequest<'a> {
    pub fn new(features: &'a RequestFeatures, attempted: &'a HashSet<String>) -> Self {
        Self {
            features,
            messages: None,
            attempted_models: attempted,
            header_override: None,
            bypass_trace_sampling: false,
            failover: false,
            downgrades_used: 0,
        }
    }
}

pub struct ModelRouter {
    config: ArcSwap<RouterConfig>,
    catalog: Arc<ModelCatalog>,
    in_flight: HashMap<String, AtomicUsize>,
    cooldowns: CooldownMap,
    penalty: Arc<Penalty429>,
    aimd: Arc<AdaptiveConcurrency>,
    overrides: OverrideStore,
    shadow_last: Mutex<Option<Decision>>,
    downgrade_shadow: Mutex<Option<DowngradeShadow>>,
    glm5_shadow_hits: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl ModelRouter {
    pub fn new(
        config: RouterConfig,
        catalog: Arc<ModelCatalog>,
        penalty: Arc<Penalty429>,
        aimd: Arc<AdaptiveConcurrency>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let in_flight =
            catalog.ids().map(|id| (id.to_string(), AtomicUsize::new(0))).collect::<HashMap<_, _>>();
        for id in catalog.ids() {
            if let Some(desc) = catalog.get(id) {
                aimd.register(id, desc.max_concurrency);
            }
        }
        let overrides = OverrideStore::new();
        for (key, model) in &config.overrides {
            let _ = overrides.set(key, model, config.max_overrides);
        }
        overrides.load(std::path::Path::new(&config.overrides_file), config.max_overrides);
        Self {
            config: ArcSwap::from_pointee(config),
            catalog,
            in_flight,
            cooldowns: CooldownMap::new(clock.clone()),
            penalty,
            aimd,
            overrides,
            shadow_last: Mutex::new(None),
            downgrade_shadow: Mutex::new(None),
            glm5_shadow_hits: AtomicU64::new(0),
            clock,
        }
    }

    pub fn config(&self) -> Arc<RouterConfig> {
        self.config.load_full()
    }

    /// Swap in an edited config. When the edit carried overrides, the store
    /// is replaced to match.
    pub fn set_config(&self, next: RouterConfig, replace_overrides: bool) {
        if replace_overrides {
            let entries = next
                .overrides
                .iter()
                .map(|(k, v)| overrides::OverrideEntry { key: k.clone(), model: v.clone() })
                .collect();
            self.overrides.replace(entries, next.max_overrides);
        }
        self.config.store(Arc::new(next));
    }

    // ---- capacity --------------------------------------------------------

    pub fn effective_max(&self, model: &str) -> usize {
        let static_max = self.catalog.get(model).map(|d| d.max_concurrency).unwrap_or(0);
        self.aimd.effective_limit(model, static_max)
    }

    pub fn model_in_flight(&self, model: &str) -> usize {
        self.in_flight.get(model).map(|c| c.load(Ordering::Acquire)).unwrap_or(0)
    }

    /// CAS acquire: increments only while below the effective ceiling.
    fn acquire_model(&self, model: &str) -> bool {
        let Some(counter) = self.in_flight.get(model) else { return false };
        let max = self.effective_max(model);
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Force-acquire ignoring the ceiling (best-effort path still respects
    /// the static max via its caller; counters stay exact).
    fn acquire_model_unchecked(&self, model: &str) -> bool {
        match self.in_flight.get(model) {
            Some(counter) => {
                counter.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Release one slot; releasing a never-acquired model is a no-op.
    pub fn release_model(&self, model: &str) {
        if let Some(counter) = self.in_flight.get(model) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    // ---- cooldown + penalty feeds ---------------------------------------

    /// Record a model cooldown; `burst_dampened` extends without escalating.
    pub fn record_model_cooldown(
        &self,
        model: &str,
        duration: Option<Duration>,
        burst_dampened: bool,
    ) {
        let cfg = self.config.load();
        self.cooldowns.record(model, duration, burst_dampened, &cfg.cooldown);
    }

    pub fn model_cooldown_remaining(&self, model: &str) -> Option<Duration> {
        let cfg = self.config.load();
        self.cooldowns.remaining(model, &cfg.cooldown)
    }

    /// Feed one upstream 429 into the sliding penalty and AIMD.
    pub fn record_429(&self, model: &str, retry_after: Option<Duration>) {
        self.penalty.record(model);
        self.aimd.observe_429(model, retry_after);
    }

    pub fn note_traffic(&self, model: &str) {
        self.aimd.observe_request(model);
    }

    /// Shortest cooldown across a tier, only when *every* member is cooling.
    pub fn tier_cooldown(&self, tier_name: &str) -> Option<Duration> {
        let cfg = self.config.load_full();
        let tier = cfg.tier(tier_name)?;
        let models: Vec<String> =
            tier.models.iter().filter(|m| self.catalog.contains(m)).cloned().collect();
        if models.is_empty() {
            return None;
        }
        let mut shortest: Option<Duration> = None;
        for model in &models {
            let remaining = self.cooldowns.remaining(model, &cfg.cooldown)?;
            shortest = Some(shortest.map_or(remaining, |s| s.min(remaining)));
        }
        shortest
    }

    // ---- overrides -------------------------------------------------------

    pub fn set_override(&self, key: &str, model: &str) -> Result<(), OverrideError> {
        let cfg = self.config.load();
        self.overrides.set(key, model, cfg.max_overrides)?;
        self.persist_overrides(&cfg.overrides_file);
        Ok(())
    }

    pub fn clear_override(&self, key: &str) -> bool {
        let cfg = self.config.load();
        let removed = self.overrides.clear(key);
        if removed {
            self.persist_overrides(&cfg.overrides_file);
        }
        removed
    }

    pub fn overrides(&self) -> Vec<overrides::OverrideEntry> {
        self.overrides.list()
    }

    fn persist_overrides(&self, path: &str) {
        if let Err(err) = self.overrides.save(std::path::Path::new(path)) {
            tracing::warn!(%err, path, "failed to persist overrides");
        }
    }

    // ---- selection -------------------------------------------------------

    /// Route a request. In shadow mode the decision is recorded but not
    /// returned and no slot is taken.
    pub fn select_model(&self, req: &SelectionRequest<'_>) -> Option<Decision> {
        let cfg = self.config.load_full();
        let shadow = cfg.shadow_mode;
        let decision = self.select_inner(&cfg, req, !shadow);
        if let Some(d) = &decision {
            if cfg.log_decisions {
                tracing::debug!(
                    model = %d.model,
                    tier = %d.tier,
                    source = ?d.source,
                    committed = d.committed,
                    reason = %d.reason,
                    "routing decision"
                );
            }
        }
        if shadow {
            *self.shadow_last.lock().unwrap_or_else(|p| p.into_inner()) = decision;
            return Option::None;
        }
        decision
    }

    /// Dry-run selection for the explain endpoint: trace always recorded,
    /// no slot taken.
    pub fn explain(&self, features: &RequestFeatures, messages: Option<&Value>) -> Option<Decision> {
        let cfg = self.config.load_full();
        let attempted = HashSet::new();
        let req = SelectionRequest {
            features,
            messages,
            attempted_models: &attempted,
            header_override: Option::None,
            bypass_trace_sampling: true,
            failover: false,
            downgrades_used: 0,
        };
        self.select_inner(&cfg, &req, false)
    }

    /// Committed decision on the default model, used when routing is
    /// shadowed or yields nothing the executor can serve.
    pub fn fallback_default(&self) -> Option<Decision> {
        let cfg = self.config.load_full();
        let features = RequestFeatures::default();
        let attempted = HashSet::new();
        let req = SelectionRequest::new(&features, &attempted);
        self.default_decision(&cfg, &req, true, DecisionSource::None, "routing fallback")
    }

    pub fn last_shadow_decision(&self) -> Option<Decision> {
        self.shadow_last.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn last_downgrade_shadow(&self) -> Option<DowngradeShadow> {
        self.downgrade_shadow.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn select_inner(
        &self,
        cfg: &RouterConfig,
        req: &SelectionRequest<'_>,
        commit: bool,
    ) -> Option<Decision> {
        if !cfg.enabled {
            return self.default_decision(cfg, req, commit, DecisionSource::None, "routing disabled");
        }

        // Precedence: header override > saved override > rule > classifier
        // > default model.
        if let Some(model) = req.header_override {
            if self.catalog.contains(model) {
                if let Some(d) =
                    self.override_decision(cfg, req, commit, model, DecisionSource::Override)
                {
                    return Some(d);
                }
                tracing::debug!(model, "header override unavailable, falling through");
            } else {
                tracing::warn!(model, "header override not in catalog, ignored");
            }
        } else if let Some(model) =
            self.overrides.resolve(req.features.client_model.as_deref())
        {
            if self.catalog.contains(&model) {
                if let Some(d) =
                    self.override_decision(cfg, req, commit, &model, DecisionSource::SavedOverride)
                {
                    return Some(d);
                }
                tracing::debug!(%model, "saved override unavailable, falling through");
            }
        }

        let Some((tier_name, class_source)) = classify::classify(cfg, req.features) else {
            return self.default_decision(
                cfg,
                req,
                commit,
                DecisionSource::Default,
                "no tier matched",
            );
        };
        let tier = cfg.tier(tier_name)?;

        let source = if req.failover {
            DecisionSource::Failover
        } else {
            match class_source {
                ClassifySource::Rule => DecisionSource::Rule,
                ClassifySource::Classifier => match tier.strategy {
                    Strategy::Pool => DecisionSource::Pool,
                    _ => DecisionSource::Classifier,
                },
            }
        };

        // glm-5 preference experiment on medium traffic. At 0 percent the
        // roll is shadow-recorded without changing behavior.
        if tier.name == "medium" && self.catalog.contains("glm-5") {
            let pct = cfg.glm5.preference_percent.clamp(0.0, 100.0);
            if pct == 0.0 {
                self.glm5_shadow_hits.fetch_add(1, Ordering::Relaxed);
            } else if rand::Rng::gen_range(&mut rand::thread_rng(), 0.0..100.0) < pct
                && !req.attempted_models.contains("glm-5")
                && !self.cooldowns.is_cooled("glm-5", &cfg.cooldown)
                && (!commit || self.acquire_model("glm-5"))
            {
                return Some(self.finish_decision(
                    cfg,
                    req,
                    Decision {
                        model: "glm-5".into(),
                        tier: tier.name.clone(),
                        source,
                        reason: "glm5 preference roll".into(),
                        strategy: tier.strategy,
                        trace: Option::None,
                        context_overflow: Option::None,
                        committed: commit,
                        degraded_from_tier: Option::None,
                        attempted_models: req.attempted_models.iter().cloned().collect(),
                        best_effort: false,
                    },
                ));
            }
        }

        self.select_in_tier(cfg, tier, req, commit, source, 0)
            .map(|d| self.finish_decision(cfg, req, d))
    }

    fn override_decision(
        &self,
        cfg: &RouterConfig,
        req: &SelectionRequest<'_>,
        commit: bool,
        model: &str,
        source: DecisionSource,
    ) -> Option<Decision> {
        if commit && !self.acquire_model(model) {
            return Option::None;
        }
        let tier = cfg
            .tiers
            .iter()
            .find(|t| t.models.iter().any(|m| m == model))
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "override".into());
        Some(self.finish_decision(
            cfg,
            req,
            Decision {
                model: model.to_string(),
                tier,
                source,
                reason: "explicit model override".into(),
                strategy: Strategy::Quality,
                trace: Option::None,
                context_overflow: Option::None,
                committed: commit,
                degraded_from_tier: Option::None,
                attempted_models: req.attempted_models.iter().cloned().collect(),
                best_effort: false,
            },
        ))
    }

    fn default_decision(
        &self,
        cfg: &RouterConfig,
        req: &SelectionRequest<'_>,
        commit: bool,
        source: DecisionSource,
        reason: &str,
    ) -> Option<Decision> {
        let model = cfg.default_model.clone()?;
        if !self.catalog.contains(&model) {
            return Option::None;
        }
        let committed = if commit { self.acquire_model(&model) } else { false };
        if commit && !committed {
            return Some(Decision {
                model: model.clone(),
                tier: "default".into(),
                source,
                reason: format!("{reason}; default model saturated"),
                strategy: Strategy::Quality,
                trace: Option::None,
                context_overflow: Some(ContextOverflow {
                    cause: OverflowCause::TransientUnavailable,
                    estimated_tokens: req.features.estimated_tokens(),
                }),
                committed: false,
                degraded_from_tier: Option::None,
                attempted_models: req.attempted_models.iter().cloned().collect(),
                best_effort: false,
            });
        }
        Some(self.finish_decision(
            cfg,
            req,
            Decision {
                model,
                tier: "default".into(),
                source,
                reason: reason.to_string(),
                strategy: Strategy::Quality,
                trace: Option::None,
                context_overflow: Option::None,
                committed,
                degraded_from_tier: Option::None,
                attempted_models: req.attempted_models.iter().cloned().collect(),
                best_effort: false,
            },
        ))
    }

    fn candidate(&self, model: &str, list_index: usize) -> Option<Candidate> {
        let desc = self.catalog.get(model)?;
        Some(Candidate {
            model: model.to_string(),
            list_index,
            in_flight: self.model_in_flight(model),
            effective_max: self.effective_max(model),
            effective_cost: desc.effective_cost(),
            penalty_factor: self.penalty.factor(model),
        })
    }

    fn select_in_tier(
        &self,
        cfg: &RouterConfig,
        tier: &TierConfig,
        req: &SelectionRequest<'_>,
        commit: bool,
        source: DecisionSource,
        depth: usize,
    ) -> Option<Decision> {
        let estimated = req.features.estimated_tokens();
        let known: Vec<(usize, &String)> = tier
            .models
            .iter()
            .enumerate()
            .filter(|(_, m)| self.catalog.contains(m))
            .collect();
        if known.is_empty() {
            return Option::None;
        }

        // Context-window guard: drop candidates that cannot hold the request.
        let fits: Vec<(usize, &String)> = known
            .iter()
            .filter(|(_, m)| {
                self.catalog
                    .get(m)
                    .and_then(|d| d.context_length)
                    .map_or(true, |ctx| ctx >= estimated)
            })
            .copied()
            .collect();
        if fits.is_empty() {
            return Some(self.overflow_decision(tier, req, OverflowCause::Genuine, estimated));
        }

        // Fully available candidates: not attempted, not cooling, free slot.
        let mut available: Vec<Candidate> = fits
            .iter()
            .filter(|(_, m)| {
                !req.attempted_models.contains(m.as_str())
                    && !self.cooldowns.is_cooled(m, &cfg.cooldown)
            })
            .filter_map(|(i, m)| self.candidate(m, *i))
            .filter(|c| c.available_slots() > 0)
            .collect();

        while !available.is_empty() {
            let Some(idx) = strategy::pick(tier.strategy, &available) else { break };
            let chosen = available[idx].model.clone();
            // Selection-then-acquire is one step: losing the CAS race just
            // removes the candidate and re-runs the strategy.
            if !commit || self.acquire_model(&chosen) {
                return Some(Decision {
                    model: chosen,
                    tier: tier.name.clone(),
                    source,
                    reason: format!("{:?} strategy pick", tier.strategy).to_lowercase(),
                    strategy: tier.strategy,
                    trace: Option::None,
                    context_overflow: Option::None,
                    committed: commit,
                    degraded_from_tier: Option::None,
                    attempted_models: req.attempted_models.iter().cloned().collect(),
                    best_effort: false,
                });
            }
            available.remove(idx);
        }

        // Downgrade targets must be healthy; a tier entered on downgrade
        // does not get the best-effort or overflow fallbacks.
        if depth > 0 {
            return Option::None;
        }

        // Nothing cleanly available. Record what a downgrade would do, then
        // apply it when allowed.
        self.record_downgrade_shadow(cfg, tier, req);
        if cfg.failover.allow_tier_downgrade
            && depth < cfg.failover.max_tier_downgrades_per_request
            && req.downgrades_used + depth < cfg.failover.max_tier_downgrades_per_request
        {
            for next_name in &cfg.failover.downgrade_order {
                if next_name == &tier.name {
                    continue;
                }
                let Some(next_tier) = cfg.tier(next_name) else { continue };
                if let Some(mut d) = self.select_in_tier(
                    cfg,
                    next_tier,
                    req,
                    commit,
                    DecisionSource::TierDowngrade,
                    depth + 1,
                ) {
                    if d.committed || !commit {
                        d.degraded_from_tier = Some(tier.name.clone());
                        return Some(d);
                    }
                }
            }
        }

        // Best-effort: every candidate is cooling but slots exist. Take the
        // one that recovers soonest rather than failing the request.
        let not_full: Vec<(usize, &String)> = fits
            .iter()
            .filter(|(_, m)| !req.attempted_models.contains(m.as_str()))
            .filter(|(_, m)| self.model_in_flight(m) < self.effective_max(m))
            .copied()
            .collect();
        if !not_full.is_empty() {
            let (_, chosen) = not_full
                .iter()
                .min_by_key(|(_, m)| {
                    self.cooldowns
                        .remaining(m, &cfg.cooldown)
                        .unwrap_or(Duration::ZERO)
                })
                .copied()?;
            let committed = if commit { self.acquire_model_unchecked(chosen) } else { false };
            return Some(Decision {
                model: chosen.clone(),
                tier: tier.name.clone(),
                source,
                reason: "warning: all candidates cooling down; best-effort least-cooled pick"
                    .into(),
                strategy: tier.strategy,
                trace: Option::None,
                context_overflow: Option::None,
                committed,
                degraded_from_tier: Option::None,
                attempted_models: req.attempted_models.iter().cloned().collect(),
                best_effort: true,
            });
        }

        // Candidates with sufficient context exist but every one is
        // saturated or already attempted: transient, uncommitted.
        Some(self.overflow_decision(tier, req, OverflowCause::TransientUnavailable, estimated))
    }

    fn overflow_decision(
        &self,
        tier: &TierConfig,
        req: &SelectionRequest<'_>,
        cause: OverflowCause,
        estimated: usize,
    ) -> Decision {
        // Surface the roomiest candidate so the error names a model.
        let roomiest = tier
            .models
            .iter()
            .filter(|m| self.catalog.contains(m))
            .max_by_key(|m| self.catalog.get(m).and_then(|d| d.context_length).unwrap_or(0))
            .cloned()
            .unwrap_or_default();
        let reason = match cause {
            OverflowCause::Genuine => {
                format!("request of ~{estimated} tokens exceeds every candidate context window")
            }
            OverflowCause::TransientUnavailable => {
                "candidates with sufficient context are temporarily unavailable".into()
            }
        };
        Decision {
            model: roomiest,
            tier: tier.name.clone(),
            source: DecisionSource::None,
            reason,
            strategy: tier.strategy,
            trace: Option::None,
            context_overflow: Some(ContextOverflow { cause, estimated_tokens: estimated }),
            committed: false,
            degraded_from_tier: Option::None,
            attempted_models: req.attempted_models.iter().cloned().collect(),
            best_effort: false,
        }
    }

    fn record_downgrade_shadow(
        &self,
        cfg: &RouterConfig,
        from: &TierConfig,
        req: &SelectionRequest<'_>,
    ) {
        for next_name in &cfg.failover.downgrade_order {
            if next_name == &from.name {
                continue;
            }
            let Some(next_tier) = cfg.tier(next_name) else { continue };
            let would = next_tier
                .models
                .iter()
                .find(|m| {
                    self.catalog.contains(m)
                        && !req.attempted_models.contains(m.as_str())
                        && !self.cooldowns.is_cooled(m, &cfg.cooldown)
                        && self.model_in_flight(m) < self.effective_max(m)
                })
                .cloned();
            *self.downgrade_shadow.lock().unwrap_or_else(|p| p.into_inner()) =
                Some(DowngradeShadow {
                    from_tier: from.name.clone(),
                    would_use_tier: next_name.clone(),
                    would_use_model: would,
                    at_millis: self.clock.now_millis(),
                });
            return;
        }
    }

    fn finish_decision(
        &self,
        cfg: &RouterConfig,
        req: &SelectionRequest<'_>,
        mut decision: Decision,
    ) -> Decision {
        if trace::should_sample(&cfg.trace, req.bypass_trace_sampling) {
            let candidates: Vec<Value> = cfg
                .tier(&decision.tier)
                .map(|tier| {
                    tier.models
                        .iter()
                        .enumerate()
                        .filter_map(|(i, m)| self.candidate(m, i))
                        .map(|c| {
                            json!({
                                "model": c.model,
                                "inFlight": c.in_flight,
                                "max": c.effective_max,
                                "available": c.available_slots(),
                                "penaltyFactor": c.penalty_factor,
                                "cooled": self.cooldowns.is_cooled(&c.model, &cfg.cooldown),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            decision.trace = Some(trace::build(
                req.features.client_model.as_deref(),
                req.features.max_tokens,
                req.messages,
                &decision.tier,
                &format!("{:?}", decision.strategy).to_lowercase(),
                candidates,
                &decision.model,
                &decision.reason,
                &cfg.trace,
            ));
        }
        decision
    }

    // ---- observability ---------------------------------------------------

    /// Tier → per-model live status, for pool-status events and `/stats`.
    pub fn pool_status(&self) -> BTreeMap<String, Vec<PoolModelStatus>> {
        let cfg = self.config.load_full();
        let mut pools = BTreeMap::new();
        for tier in &cfg.tiers {
            let statuses: Vec<PoolModelStatus> = tier
                .models
                .iter()
                .filter(|m| self.catalog.contains(m))
                .map(|m| {
                    let in_flight = self.model_in_flight(m);
                    let max = self.effective_max(m);
                    PoolModelStatus {
                        model: m.clone(),
                        in_flight,
                        max_concurrency: max,
                        available: max.saturating_sub(in_flight),
                    }
                })
                .collect();
            pools.insert(tier.name.clone(), statuses);
        }
        pools
    }

    pub fn stats(&self) -> Value {
        let cfg = self.config.load_full();
        json!({
            "inFlight": self
                .in_flight
                .iter()
                .map(|(m, c)| (m.clone(), c.load(Ordering::Acquire)))
                .collect::<BTreeMap<String, usize>>(),
            "cooldowns": self.cooldowns.snapshot(),
            "overrides": self.overrides.list(),
            "glm5ShadowHits": self.glm5_shadow_hits.load(Ordering::Relaxed),
            "lastShadowDecision": self.last_shadow_decision(),
            "lastDowngradeShadow": self.last_downgrade_shadow(),
            "aimd": self.aimd.snapshot(),
            "shadowMode": cfg.shadow_mode,
        })
    }

    /// Init-equivalent state: counters zeroed, cooldowns, overrides, and
    /// shadow records cleared.
    pub fn reset(&self) {
        for counter in self.in_flight.values() {
            counter.store(0, Ordering::Release);
        }
        self.cooldowns.clear();
        self.overrides.clear_all();
        self.penalty.reset();
        self.aimd.reset();
        *self.shadow_last.lock().unwrap_or_else(|p| p.into_inner()) = Option::None;
        *self.downgrade_shadow.lock().unwrap_or_else(|p| p.into_inner()) = Option::None;
        self.glm5_shadow_hits.store(0, Ordering::Relaxed);
        tracing::info!("model router reset");
    }
}

/// Live capacity line for one model inside a tier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolModelStatus {
    pub model: String,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub available: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AimdSettings, PenaltySettings};

    fn router_with(config: RouterConfig) -> (ModelRouter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let catalog = Arc::new(ModelCatalog::builtin());
        let penalty =
            Arc::new(Penalty429::new(PenaltySettings::default(), clock.clone() as Arc<dyn Clock>));
        let aimd = Arc::new(AdaptiveConcurrency::new(
            AimdSettings::default(),
            clock.clone() as Arc<dyn Clock>,
        ));
        (ModelRouter::new(config, catalog, penalty, aimd, clock.clone() as Arc<dyn Clock>), clock)
    }

    fn router() -> (ModelRouter, Arc<ManualClock>) {
        let mut cfg = RouterConfig::default();
        // Tests do not touch the filesystem.
        cfg.overrides_file = "/nonexistent/glm-proxy-test-overrides.json".into();
        cfg.trace.sampling_rate = 0.0;
        router_with(cfg)
    }

    fn heavy_features() -> RequestFeatures {
        RequestFeatures {
            client_model: Some("claude-3-opus-20240229".into()),
            max_tokens: 8_192,
            message_count: 1,
            approx_chars: 2,
            ..RequestFeatures::default()
        }
    }

    fn select(router: &ModelRouter, features: &RequestFeatures) -> Option<Decision> {
        let attempted = HashSet::new();
        router.select_model(&SelectionRequest::new(features, &attempted))
    }

    #[test]
    fn heavy_request_routes_to_flagship() {
        let (router, _clock) = router();
        let d = select(&router, &heavy_features()).unwrap();
        assert_eq!(d.model, "glm-5");
        assert_eq!(d.tier, "heavy");
        assert_eq!(d.source, DecisionSource::Rule);
        assert!(d.committed);
        assert_eq!(router.model_in_flight("glm-5"), 1);
    }

    #[test]
    fn cooled_flagship_falls_to_next_in_list() {
        let (router, _clock) = router();
        router.record_model_cooldown("glm-5", Some(Duration::from_secs(10)), false);
        let d = select(&router, &heavy_features()).unwrap();
        assert_eq!(d.model, "glm-4.7");
        assert_eq!(d.source, DecisionSource::Rule);
        assert!(d.committed);
    }

    #[test]
    fn fully_cooled_tier_yields_best_effort_warning() {
        let (router, _clock) = router();
        for m in ["glm-5", "glm-4.7", "glm-4.6"] {
            router.record_model_cooldown(m, Some(Duration::from_secs(10)), false);
        }
        let d = select(&router, &heavy_features()).unwrap();
        assert!(d.committed);
        assert!(d.reason.contains("warning"));
        assert!(d.best_effort);
        // Least-cooled pick: all equal here, any heavy member qualifies.
        assert!(["glm-5", "glm-4.7", "glm-4.6"].contains(&d.model.as_str()));
    }

    #[test]
    fn best_effort_prefers_least_cooled() {
        let (router, _clock) = router();
        router.record_model_cooldown("glm-5", Some(Duration::from_secs(60)), false);
        router.record_model_cooldown("glm-4.7", Some(Duration::from_secs(2)), false);
        router.record_model_cooldown("glm-4.6", Some(Duration::from_secs(30)), false);
        let d = select(&router, &heavy_features()).unwrap();
        assert_eq!(d.model, "glm-4.7");
        assert!(d.best_effort);
    }

    #[test]
    fn saturated_context_fit_reports_transient_overflow() {
        let (router, _clock) = router();
        let mut cfg = RouterConfig::default();
        cfg.overrides_file = "/nonexistent/x.json".into();
        cfg.trace.sampling_rate = 0.0;
        // A tier where only glm-4.7-flash (200K) can hold a 150K request.
        cfg.tiers = vec![crate::config::TierConfig {
            name: "heavy".into(),
            models: vec!["glm-4.6".into(), "glm-4.7-flash".into()],
            strategy: Strategy::Quality,
            client_model_policy: crate::config::ClientModelPolicy::AlwaysRoute,
        }];
        cfg.rules = vec![crate::config::RouteRule {
            model_glob: Some("*".into()),
            tier: "heavy".into(),
            ..Default::default()
        }];
        router.set_config(cfg, false);

        let features = RequestFeatures {
            client_model: Some("claude-3-opus-20240229".into()),
            max_tokens: 20_000,
            approx_chars: 520_000, // ~130K tokens + 20K output
            ..RequestFeatures::default()
        };
        // Saturate the only fitting model.
        for _ in 0..50 {
            assert!(router.model_in_flight("glm-4.7-flash") < 50);
            let attempted = HashSet::new();
            let d = router
                .select_model(&SelectionRequest::new(&features, &attempted))
                .unwrap();
            assert_eq!(d.model, "glm-4.7-flash");
        }
        let attempted = HashSet::new();
        let d = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();
        assert!(!d.committed);
        let overflow = d.context_overflow.unwrap();
        assert_eq!(overflow.cause, OverflowCause::TransientUnavailable);
    }

    #[test]
    fn genuine_overflow_when_nothing_fits() {
        let (router, _clock) = router();
        let features = RequestFeatures {
            client_model: Some("claude-3-opus-20240229".into()),
            max_tokens: 100_000,
            approx_chars: 2_000_000, // ~500K tokens, beyond every window
            ..RequestFeatures::default()
        };
        let d = select(&router, &features).unwrap();
        assert!(!d.committed);
        assert_eq!(d.context_overflow.unwrap().cause, OverflowCause::Genuine);
    }

    #[test]
    fn acquire_release_round_trip() {
        let (router, _clock) = router();
        let before = router.model_in_flight("glm-5");
        let d = select(&router, &heavy_features()).unwrap();
        assert_eq!(router.model_in_flight("glm-5"), before + 1);
        router.release_model(&d.model);
        assert_eq!(router.model_in_flight("glm-5"), before);
    }

    #[test]
    fn release_without_acquire_is_noop() {
        let (router, _clock) = router();
        router.release_model("glm-5");
        router.release_model("glm-5");
        assert_eq!(router.model_in_flight("glm-5"), 0);
    }

    #[test]
    fn concurrent_selection_never_oversubscribes() {
        let (router, _clock) = router();
        let router = Arc::new(router);
        let max = router.effective_max("glm-5");
        let mut handles = Vec::new();
        for _ in 0..max * 3 {
            let router = router.clone();
            handles.push(std::thread::spawn(move || {
                let features = RequestFeatures {
                    client_model: Some("claude-3-opus-20240229".into()),
                    max_tokens: 8_192,
                    ..RequestFeatures::default()
                };
                let attempted = HashSet::new();
                router
                    .select_model(&SelectionRequest::new(&features, &attempted))
                    .map(|d| d.model)
            }));
        }
        let picks: Vec<Option<String>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let glm5_picks = picks.iter().flatten().filter(|m| m.as_str() == "glm-5").count();
        assert_eq!(glm5_picks, max, "exactly max slots granted");
        assert_eq!(router.model_in_flight("glm-5"), max);
    }

    #[test]
    fn tier_downgrade_when_enabled() {
        let (router, _clock) = router();
        let mut cfg = (*router.config()).clone();
        cfg.failover.allow_tier_downgrade = true;
        router.set_config(cfg, false);
        for m in ["glm-5", "glm-4.7", "glm-4.6"] {
            router.record_model_cooldown(m, Some(Duration::from_secs(30)), false);
        }
        let d = select(&router, &heavy_features()).unwrap();
        assert_eq!(d.source, DecisionSource::TierDowngrade);
        assert_eq!(d.degraded_from_tier.as_deref(), Some("heavy"));
        assert_eq!(d.model, "glm-4.7-flash", "light tier after cooled medium");
        assert!(d.committed);
    }

    #[test]
    fn downgrade_shadow_recorded_even_when_disabled() {
        let (router, _clock) = router();
        for m in ["glm-5", "glm-4.7", "glm-4.6"] {
            router.record_model_cooldown(m, Some(Duration::from_secs(30)), false);
        }
        let _ = select(&router, &heavy_features()).unwrap();
        let shadow = router.last_downgrade_shadow().unwrap();
        assert_eq!(shadow.from_tier, "heavy");
    }

    #[test]
    fn header_override_wins() {
        let (router, _clock) = router();
        let attempted = HashSet::new();
        let features = heavy_features();
        let mut req = SelectionRequest::new(&features, &attempted);
        req.header_override = Some("glm-4.7-flash");
        let d = router.select_model(&req).unwrap();
        assert_eq!(d.model, "glm-4.7-flash");
        assert_eq!(d.source, DecisionSource::Override);
    }

    #[test]
    fn saved_override_applies_before_rules() {
        let (router, _clock) = router();
        router.set_override("claude-3-opus-20240229", "glm-4.6").unwrap();
        let d = select(&router, &heavy_features()).unwrap();
        assert_eq!(d.model, "glm-4.6");
        assert_eq!(d.source, DecisionSource::SavedOverride);
    }

    #[test]
    fn shadow_mode_records_without_serving() {
        let (router, _clock) = router();
        let mut cfg = (*router.config()).clone();
        cfg.shadow_mode = true;
        router.set_config(cfg, false);
        assert!(select(&router, &heavy_features()).is_none());
        let shadow = router.last_shadow_decision().unwrap();
        assert_eq!(shadow.model, "glm-5");
        assert!(!shadow.committed, "shadow decisions take no slot");
        assert_eq!(router.model_in_flight("glm-5"), 0);
    }

    #[test]
    fn disabled_router_falls_to_default_model() {
        let (router, _clock) = router();
        let mut cfg = (*router.config()).clone();
        cfg.enabled = false;
        router.set_config(cfg, false);
        let d = select(&router, &heavy_features()).unwrap();
        assert_eq!(d.model, "glm-4.7");
        assert_eq!(d.source, DecisionSource::None);
        assert!(d.committed);
    }

    #[test]
    fn explain_bypasses_sampling_and_takes_no_slot() {
        let (router, _clock) = router();
        let d = router.explain(&heavy_features(), Option::None).unwrap();
        assert!(d.trace.is_some(), "explain always records a trace");
        assert!(!d.committed);
        assert_eq!(router.model_in_flight(&d.model), 0);
    }

    #[test]
    fn reset_restores_init_state() {
        let (router, _clock) = router();
        let _ = select(&router, &heavy_features()).unwrap();
        router.record_model_cooldown("glm-4.6", Some(Duration::from_secs(30)), false);
        router.set_override("k", "glm-5").unwrap();
        router.reset();
        assert_eq!(router.model_in_flight("glm-5"), 0);
        assert!(router.model_cooldown_remaining("glm-4.6").is_none());
        assert!(router.overrides().is_empty());
    }

    #[test]
    fn attempted_models_are_skipped() {
        let (router, _clock) = router();
        let attempted: HashSet<String> = ["glm-5".to_string()].into_iter().collect();
        let features = heavy_features();
        let mut req = SelectionRequest::new(&features, &attempted);
        req.failover = true;
        let d = router.select_model(&req).unwrap();
        assert_eq!(d.model, "glm-4.7");
        assert_eq!(d.source, DecisionSource::Failover);
    }

    #[test]
    fn tier_cooldown_only_when_all_members_cool() {
        let (router, _clock) = router();
        router.record_model_cooldown("glm-5", Some(Duration::from_secs(10)), false);
        assert!(router.tier_cooldown("heavy").is_none());
        router.record_model_cooldown("glm-4.7", Some(Duration::from_secs(20)), false);
        router.record_model_cooldown("glm-4.6", Some(Duration::from_secs(30)), false);
        let cooldown = router.tier_cooldown("heavy").unwrap();
        assert!(cooldown <= Duration::from_secs(10));
    }
}
