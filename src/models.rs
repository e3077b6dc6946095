// Model catalog - gateway-facing ids mapped onto upstream models
//
// Each entry fixes the upstream model name, the optional mode flag, the
// request cost class, and the ordered list of token pools to draw from.
// Premium-tier models try the super pool first; cheap models drain the basic
// pool before touching super quota.

use crate::token::Effort;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    /// OpenAI-facing model id
    pub id: &'static str,
    /// Upstream model name sent as `modelName`
    pub upstream_model: &'static str,
    /// Upstream `modelMode`, when one applies
    pub mode: Option<&'static str>,
    /// Per-request quota cost class
    pub cost: Effort,
    /// Token pool candidates in preference order
    pub pools: &'static [&'static str],
}

const DEFAULT_POOLS: &[&str] = &["ssoBasic", "ssoSuper"];
const PREMIUM_POOLS: &[&str] = &["ssoSuper", "ssoBasic"];

pub const MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "grok-3",
        upstream_model: "grok-3",
        mode: None,
        cost: Effort::Low,
        pools: DEFAULT_POOLS,
    },
    ModelInfo {
        id: "grok-3-fast",
        upstream_model: "grok-3",
        mode: Some("MODEL_MODE_FAST"),
        cost: Effort::Low,
        pools: PREMIUM_POOLS,
    },
    ModelInfo {
        id: "grok-4",
        upstream_model: "grok-4",
        mode: Some("MODEL_MODE_EXPERT"),
        cost: Effort::High,
        pools: PREMIUM_POOLS,
    },
    ModelInfo {
        id: "grok-4-mini",
        upstream_model: "grok-4-mini",
        mode: None,
        cost: Effort::Low,
        pools: DEFAULT_POOLS,
    },
    ModelInfo {
        id: "grok-imagine",
        upstream_model: "grok-3",
        mode: Some("MODEL_MODE_IMAGE_GEN"),
        cost: Effort::Low,
        pools: DEFAULT_POOLS,
    },
];

pub fn get(id: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.id == id)
}

/// Pool candidate order for a model; unknown ids fall back to the default.
pub fn pool_candidates(id: &str) -> &'static [&'static str] {
    get(id).map(|m| m.pools).unwrap_or(DEFAULT_POOLS)
}

/// Static `/v1/models` payload.
pub fn catalog() -> Value {
    let data: Vec<Value> = MODELS
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "created": 0,
                "owned_by": "grokgate",
            })
        })
        .collect();
    json!({ "object": "list", "data": data })
}
