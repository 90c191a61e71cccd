//! Routing behavior through the public API: tier classification, cooldown
//! bypass, exhaustion fallbacks, and the context-window guard.

use glm_proxy::aimd::AdaptiveConcurrency;
use glm_proxy::catalog::ModelCatalog;
use glm_proxy::clock::{Clock, ManualClock};
use glm_proxy::config::{AimdSettings, PenaltySettings, RouterConfig, Strategy};
use glm_proxy::pool::Penalty429;
use glm_proxy::router::classify::RequestFeatures;
use glm_proxy::router::{DecisionSource, ModelRouter, OverflowCause, SelectionRequest};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn build_router(mut config: RouterConfig) -> (ModelRouter, Arc<ManualClock>) {
    config.overrides_file = "/nonexistent/glm-proxy-scenario-overrides.json".into();
    config.trace.sampling_rate = 0.0;
    let clock = Arc::new(ManualClock::new());
    let catalog = Arc::new(ModelCatalog::builtin());
    let penalty =
        Arc::new(Penalty429::new(PenaltySettings::default(), clock.clone() as Arc<dyn Clock>));
    let aimd = Arc::new(AdaptiveConcurrency::new(
        AimdSettings::default(),
        clock.clone() as Arc<dyn Clock>,
    ));
    let router =
        ModelRouter::new(config, catalog, penalty, aimd, clock.clone() as Arc<dyn Clock>);
    (router, clock)
}

fn opus_features() -> RequestFeatures {
    RequestFeatures::from_body(&json!({
        "model": "claude-3-opus-20240229",
        "max_tokens": 8192,
        "messages": [{"role": "user", "content": "hi"}]
    }))
}

#[test]
fn heavy_request_lands_on_glm5_via_rule() {
    let (router, _clock) = build_router(RouterConfig::default());
    let attempted = HashSet::new();
    let features = opus_features();
    let decision = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();

    assert_eq!(decision.model, "glm-5");
    assert_eq!(decision.tier, "heavy");
    assert_eq!(decision.source, DecisionSource::Rule);
    assert!(decision.committed);
}

#[test]
fn cooled_glm5_is_bypassed_for_next_candidate() {
    let (router, _clock) = build_router(RouterConfig::default());
    router.record_model_cooldown("glm-5", Some(Duration::from_secs(10)), false);

    let attempted = HashSet::new();
    let features = opus_features();
    let decision = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();

    assert_eq!(decision.model, "glm-4.7");
    assert_eq!(decision.source, DecisionSource::Rule);
    assert!(decision.committed);
}

#[test]
fn exhausted_tier_without_downgrade_serves_best_effort() {
    let (router, _clock) = build_router(RouterConfig::default());
    router.record_model_cooldown("glm-5", Some(Duration::from_secs(60)), false);
    router.record_model_cooldown("glm-4.7", Some(Duration::from_secs(5)), false);
    router.record_model_cooldown("glm-4.6", Some(Duration::from_secs(30)), false);

    let attempted = HashSet::new();
    let features = opus_features();
    let decision = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();

    assert!(decision.committed);
    assert!(decision.reason.contains("warning"));
    assert_eq!(decision.model, "glm-4.7", "least-cooled candidate wins");
}

#[test]
fn transient_context_overflow_when_fitting_model_is_saturated() {
    let mut config = RouterConfig::default();
    // Only glm-4.7-flash (200K) can hold the request in this tier.
    config.tiers = vec![glm_proxy::config::TierConfig {
        name: "heavy".into(),
        models: vec!["glm-4.6".into(), "glm-4.7-flash".into()],
        strategy: Strategy::Quality,
        client_model_policy: glm_proxy::config::ClientModelPolicy::AlwaysRoute,
    }];
    config.rules = vec![glm_proxy::config::RouteRule {
        model_glob: Some("*".into()),
        tier: "heavy".into(),
        ..Default::default()
    }];
    let (router, _clock) = build_router(config);

    let features = RequestFeatures {
        client_model: Some("claude-3-opus-20240229".into()),
        max_tokens: 20_000,
        approx_chars: 520_000,
        ..RequestFeatures::default()
    };

    // Saturate glm-4.7-flash completely.
    let attempted = HashSet::new();
    for _ in 0..50 {
        let d = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();
        assert_eq!(d.model, "glm-4.7-flash");
        assert!(d.committed);
    }

    let decision = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();
    assert!(!decision.committed, "no slot is taken on overflow");
    let overflow = decision.context_overflow.expect("overflow populated");
    assert_eq!(overflow.cause, OverflowCause::TransientUnavailable);
}

#[test]
fn genuine_context_overflow_when_nothing_fits() {
    let (router, _clock) = build_router(RouterConfig::default());
    let features = RequestFeatures {
        client_model: Some("claude-3-opus-20240229".into()),
        max_tokens: 50_000,
        approx_chars: 3_000_000,
        ..RequestFeatures::default()
    };
    let attempted = HashSet::new();
    let decision = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();
    assert!(!decision.committed);
    assert_eq!(decision.context_overflow.unwrap().cause, OverflowCause::Genuine);
}

#[test]
fn acquire_then_release_is_idempotent_at_zero() {
    let (router, _clock) = build_router(RouterConfig::default());
    let attempted = HashSet::new();
    let features = opus_features();
    let decision = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();
    assert_eq!(router.model_in_flight(&decision.model), 1);
    router.release_model(&decision.model);
    assert_eq!(router.model_in_flight(&decision.model), 0);
    // Extra releases never go negative.
    router.release_model(&decision.model);
    router.release_model(&decision.model);
    assert_eq!(router.model_in_flight(&decision.model), 0);
}

#[test]
fn burst_dampened_cooldown_never_shortens() {
    let (router, _clock) = build_router(RouterConfig::default());
    router.record_model_cooldown("glm-5", Some(Duration::from_secs(60)), false);
    let before = router.model_cooldown_remaining("glm-5").unwrap();
    router.record_model_cooldown("glm-5", Some(Duration::from_millis(500)), true);
    let after = router.model_cooldown_remaining("glm-5").unwrap();
    assert!(after >= before - Duration::from_millis(50));
}

#[test]
fn reset_returns_router_to_init_state() {
    let (router, _clock) = build_router(RouterConfig::default());
    let attempted = HashSet::new();
    let features = opus_features();
    let _ = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();
    router.record_model_cooldown("glm-4.6", Some(Duration::from_secs(30)), false);
    router.set_override("claude-3-haiku", "glm-4.7-flash").unwrap();

    router.reset();

    assert_eq!(router.model_in_flight("glm-5"), 0);
    assert!(router.model_cooldown_remaining("glm-4.6").is_none());
    assert!(router.overrides().is_empty());
    // And routing works again from scratch.
    let decision = router.select_model(&SelectionRequest::new(&features, &attempted)).unwrap();
    assert_eq!(decision.model, "glm-5");
}
