use indexmap::IndexMap;
use serde::Deserialize;

/// Pricing and quota ledger settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BillingConfig {
    /// Quota units per currency unit, applied to fixed prices
    #[serde(default = "default_quota_per_unit")]
    pub quota_per_unit: f64,
    /// Tenants whose balance exceeds this amount skip the reservation, 0 disables
    #[serde(default)]
    pub trust_quota: i64,
    /// Completion tokens assumed when a request does not set `max_tokens`
    #[serde(default = "default_preconsume_tokens")]
    pub preconsume_tokens: u32,
    /// Ratio applied to models missing from `models`, unknown models are rejected when unset
    #[serde(default)]
    pub default_model_ratio: Option<f64>,
    /// Per-model prices
    #[serde(default)]
    pub models: IndexMap<String, ModelPrice>,
    /// Per-group multipliers, groups not listed use 1.0
    #[serde(default)]
    pub groups: IndexMap<String, f64>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: default_quota_per_unit(),
            trust_quota: 0,
            preconsume_tokens: default_preconsume_tokens(),
            default_model_ratio: None,
            models: IndexMap::new(),
            groups: IndexMap::new(),
        }
    }
}

/// Price of a single model
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPrice {
    /// Quota per token
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    /// Multiplier for completion tokens relative to prompt tokens
    #[serde(default = "default_ratio")]
    pub completion_ratio: f64,
    /// Fixed price per call, overrides token pricing
    #[serde(default)]
    pub price: Option<f64>,
}

const fn default_quota_per_unit() -> f64 {
    500_000.0
}

const fn default_preconsume_tokens() -> u32 {
    1000
}

const fn default_ratio() -> f64 {
    1.0
}
