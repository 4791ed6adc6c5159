use serde::{Deserialize, Serialize};

/// Token counts reported by an upstream for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    /// Prompt tokens served from a provider-side cache
    #[serde(default)]
    pub cached_tokens: u32,
}

impl Usage {
    pub const fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Estimated cost of a request, computed before the provider call
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    /// Quota units to reserve
    pub amount: i64,
    /// Model ratio applied to token counts
    pub model_ratio: f64,
    /// Multiplier for completion tokens relative to prompt tokens
    pub completion_ratio: f64,
    /// Ratio of the tenant group
    pub group_ratio: f64,
    /// Whether the model is billed per call rather than per token
    pub fixed_price: bool,
}

impl Quote {
    /// Whether the request costs nothing and skips the ledger entirely
    pub const fn is_free(&self) -> bool {
        self.amount <= 0
    }
}
