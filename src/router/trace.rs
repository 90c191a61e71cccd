//! Decision traces.
//!
//! A sampled subset of routing decisions records the inputs and the
//! candidate scoring that produced them. Payloads are capped: over the
//! limit, candidates and input messages are truncated and `_truncated` is
//! set; if the payload still exceeds the cap, `_warning` marks it.

use crate::config::TraceConfig;
use rand::Rng;
use serde_json::{json, Value};

pub const MAX_CANDIDATES: usize = 5;
pub const MAX_MESSAGES: usize = 3;

/// Sampling roll; `bypass` (tests, explain endpoint) always records.
pub fn should_sample(cfg: &TraceConfig, bypass: bool) -> bool {
    if bypass {
        return true;
    }
    let rate = cfg.sampling_rate.clamp(0.0, 100.0);
    rate > 0.0 && rand::thread_rng().gen_range(0.0..100.0) < rate
}

fn payload_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Assemble a trace payload, enforcing the size cap.
pub fn build(
    client_model: Option<&str>,
    max_tokens: u64,
    messages: Option<&Value>,
    tier: &str,
    strategy: &str,
    candidates: Vec<Value>,
    chosen: &str,
    reason: &str,
    cfg: &TraceConfig,
) -> Value {
    let mut trace = json!({
        "input": {
            "model": client_model,
            "maxTokens": max_tokens,
            "messages": messages.cloned().unwrap_or(Value::Null),
        },
        "modelSelection": {
            "tier": tier,
            "strategy": strategy,
            "candidates": candidates,
            "chosen": chosen,
            "reason": reason,
        },
    });

    if payload_size(&trace) <= cfg.max_payload_size {
        return trace;
    }

    if let Some(cands) = trace["modelSelection"]["candidates"].as_array_mut() {
        cands.truncate(MAX_CANDIDATES);
    }
    if let Some(msgs) = trace["input"]["messages"].as_array_mut() {
        msgs.truncate(MAX_MESSAGES);
    }
    trace["_truncated"] = json!(true);

    if payload_size(&trace) > cfg.max_payload_size {
        trace["_warning"] = json!("trace exceeds payload cap after truncation");
    }
    trace
}
