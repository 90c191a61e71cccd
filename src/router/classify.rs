//! Request feature extraction and tier classification.
//!
//! Rules run first, in order, ANDing their present conditions. When no rule
//! matches, the heuristic sorts the request into heavy / light / medium
//! from its structural features. Tiers marked rule-match-only are invisible
//! to the heuristic.

use crate::config::{ClientModelPolicy, RouteRule, RouterConfig};
use serde::Serialize;

/// Structural features parsed once per request from the client body.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFeatures {
    pub client_model: Option<String>,
    pub max_tokens: u64,
    pub has_tools: bool,
    pub has_vision: bool,
    pub message_count: usize,
    pub system_length: usize,
    pub approx_chars: usize,
    pub image_blocks: usize,
    pub tool_count: usize,
    pub stream: bool,
}

/// Token-cost constant for one image block.
const IMAGE_BLOCK_TOKENS: usize = 260;
/// Token-cost constant for one tool definition.
const TOOL_DEF_TOKENS: usize = 200;

impl RequestFeatures {
    /// Walk a chat/messages body. Unknown shapes degrade to zeroed features
    /// rather than errors; the executor already validated it is JSON.
    pub fn from_body(body: &serde_json::Value) -> Self {
        let mut features = Self {
            client_model: body.get("model").and_then(|v| v.as_str()).map(String::from),
            max_tokens: body.get("max_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            stream: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
            ..Self::default()
        };

        match body.get("system") {
            Some(serde_json::Value::String(s)) => features.system_length = s.len(),
            Some(serde_json::Value::Array(blocks)) => {
                features.system_length = blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .map(str::len)
                    .sum();
            }
            _ => {}
        }
        features.approx_chars += features.system_length;

        if let Some(tools) = body.get("tools").and_then(|v| v.as_array()) {
            features.tool_count = tools.len();
            features.has_tools = !tools.is_empty();
            features.approx_chars +=
                tools.iter().map(|t| t.to_string().len()).sum::<usize>();
        }

        if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
            features.message_count = messages.len();
            for message in messages {
                match message.get("content") {
                    Some(serde_json::Value::String(s)) => features.approx_chars += s.len(),
                    Some(serde_json::Value::Array(blocks)) => {
                        for block in blocks {
                            match block.get("type").and_then(|t| t.as_str()) {
                                Some("image") => {
                                    features.image_blocks += 1;
                                    features.has_vision = true;
                                }
                                _ => {
                                    if let Some(text) =
                                        block.get("text").and_then(|t| t.as_str())
                                    {
                                        features.approx_chars += text.len();
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        features
    }

    /// Estimated request tokens for the context-window guard:
    /// `ceil(chars / 4) + max_tokens` plus block constants, safety margin 1.0.
    pub fn estimated_tokens(&self) -> usize {
        self.approx_chars.div_ceil(4)
            + self.max_tokens as usize
            + self.image_blocks * IMAGE_BLOCK_TOKENS
            + self.tool_count * TOOL_DEF_TOKENS
    }
}

/// `*`-wildcard glob match.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let mut parts = pattern.split('*').peekable();
    let mut pos = 0usize;
    let mut first = true;
    let anchored_end = !pattern.ends_with('*');
    while let Some(part) = parts.next() {
        if part.is_empty() {
            first = false;
            continue;
        }
        match value[pos..].find(part) {
            Some(found) => {
                if first && found != 0 {
                    return false;
                }
                pos += found + part.len();
            }
            None => return false,
        }
        if parts.peek().is_none() && anchored_end && pos != value.len() {
            return false;
        }
        first = false;
    }
    true
}

fn rule_matches(rule: &RouteRule, features: &RequestFeatures) -> bool {
    if let Some(glob) = &rule.model_glob {
        match &features.client_model {
            Some(model) if glob_match(glob, model) => {}
            _ => return false,
        }
    }
    if let Some(min) = rule.max_tokens_gte {
        if features.max_tokens < min {
            return false;
        }
    }
    if let Some(want) = rule.has_tools {
        if features.has_tools != want {
            return false;
        }
    }
    if let Some(want) = rule.has_vision {
        if features.has_vision != want {
            return false;
        }
    }
    if let Some(min) = rule.message_count_gte {
        if features.message_count < min {
            return false;
        }
    }
    if let Some(min) = rule.system_length_gte {
        if features.system_length < min {
            return false;
        }
    }
    true
}

/// How a classification was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifySource {
    Rule,
    Classifier,
}

/// Classify a request into a tier name, or `None` when nothing matches
/// (caller falls to the default model).
pub fn classify<'a>(
    config: &'a RouterConfig,
    features: &RequestFeatures,
) -> Option<(&'a str, ClassifySource)> {
    for rule in &config.rules {
        if rule_matches(rule, features) && config.tier(&rule.tier).is_some() {
            return Some((rule.tier.as_str(), ClassifySource::Rule));
        }
    }

    let heavy = &config.classifier.heavy;
    let light = &config.classifier.light;
    let mut tier = if features.max_tokens >= heavy.max_tokens_gte
        || features.has_tools
        || features.has_vision
        || features.message_count >= heavy.message_count_gte
        || features.system_length >= heavy.system_length_gte
    {
        "heavy"
    } else if features.max_tokens <= light.max_tokens_lte
        && features.message_count <= light.message_count_lte
        && features.system_length <= light.system_length_lte
    {
        "light"
    } else {
        "medium"
    };

    let upgrade = &config.complexity_upgrade;
    if tier == "medium"
        && upgrade.enabled
        && (features.message_count >= upgrade.message_count_gte
            || features.system_length >= upgrade.system_length_gte)
    {
        tier = "heavy";
    }

    let tier_cfg = config.tier(tier)?;
    // Heuristic traffic never lands in a rule-match-only tier.
    if tier_cfg.client_model_policy == ClientModelPolicy::RuleMatchOnly {
        return None;
    }
    Some((tier_cfg.name.as_str(), ClassifySource::Classifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn features(body: serde_json::Value) -> RequestFeatures {
        RequestFeatures::from_body(&body)
    }

    #[test]
    fn parses_basic_body() {
        let f = features(json!({
            "model": "claude-3-opus-20240229",
            "max_tokens": 8192,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(f.client_model.as_deref(), Some("claude-3-opus-20240229"));
        assert_eq!(f.max_tokens, 8192);
        assert_eq!(f.message_count, 1);
        assert_eq!(f.approx_chars, 2);
        assert!(!f.has_tools);
    }

    #[test]
    fn detects_vision_and_tools() {
        let f = features(json!({
            "model": "m",
            "tools": [{"name": "lookup", "input_schema": {}}],
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64"}},
                {"type": "text", "text": "what is this"}
            ]}]
        }));
        assert!(f.has_tools);
        assert!(f.has_vision);
        assert_eq!(f.image_blocks, 1);
        assert_eq!(f.tool_count, 1);
    }

    #[test]
    fn token_estimate_includes_block_constants() {
        let f = RequestFeatures {
            approx_chars: 400,
            max_tokens: 1000,
            image_blocks: 2,
            tool_count: 1,
            ..RequestFeatures::default()
        };
        assert_eq!(f.estimated_tokens(), 100 + 1000 + 2 * 260 + 200);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("claude-3-opus*", "claude-3-opus-20240229"));
        assert!(!glob_match("claude-3-opus*", "claude-3-sonnet-20240229"));
        assert!(glob_match("*opus*", "claude-3-opus-20240229"));
        assert!(glob_match("claude-*-opus-*", "claude-3-opus-20240229"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn rule_beats_heuristic() {
        let config = RouterConfig::default();
        let f = features(json!({
            "model": "claude-3-opus-20240229",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        // Tiny request, but the opus rule pins it to heavy.
        let (tier, source) = classify(&config, &f).unwrap();
        assert_eq!(tier, "heavy");
        assert_eq!(source, ClassifySource::Rule);
    }

    #[test]
    fn heuristic_tiers() {
        let config = RouterConfig::default();
        let light = features(json!({
            "model": "m", "max_tokens": 256,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(classify(&config, &light).unwrap().0, "light");

        let medium = features(json!({
            "model": "m", "max_tokens": 4096,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(classify(&config, &medium).unwrap().0, "medium");

        let heavy = features(json!({
            "model": "m", "max_tokens": 9000,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let (tier, source) = classify(&config, &heavy).unwrap();
        assert_eq!(tier, "heavy");
        assert_eq!(source, ClassifySource::Classifier);
    }

    #[test]
    fn tools_force_heavy() {
        let config = RouterConfig::default();
        let f = features(json!({
            "model": "m", "max_tokens": 64,
            "tools": [{"name": "t"}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(classify(&config, &f).unwrap().0, "heavy");
    }

    #[test]
    fn rule_match_only_tier_invisible_to_heuristic() {
        let mut config = RouterConfig::default();
        for tier in &mut config.tiers {
            if tier.name == "light" {
                tier.client_model_policy = ClientModelPolicy::RuleMatchOnly;
            }
        }
        let f = features(json!({
            "model": "m", "max_tokens": 256,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(classify(&config, &f).is_none());
    }

    #[test]
    fn complexity_upgrade_promotes_medium() {
        let mut config = RouterConfig::default();
        config.complexity_upgrade.enabled = true;
        config.complexity_upgrade.message_count_gte = 10;
        let f = RequestFeatures {
            max_tokens: 4096,
            message_count: 12,
            ..RequestFeatures::default()
        };
        assert_eq!(classify(&config, &f).unwrap().0, "heavy");
    }
}
