use conduit_config::{BillingConfig, ModelPrice};
use conduit_core::{Quote, Usage};
use serde_json::Value;

use crate::error::LedgerError;

const CHARS_PER_TOKEN: usize = 4;

/// Price quotes computed from configured model and group ratios
#[derive(Debug, Clone)]
pub struct Pricing {
    config: BillingConfig,
}

impl Pricing {
    pub const fn new(config: BillingConfig) -> Self {
        Self { config }
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.config.groups.get(group).copied().unwrap_or(1.0)
    }

    fn model_price(&self, model: &str) -> Result<ModelPrice, LedgerError> {
        if let Some(price) = self.config.models.get(model) {
            return Ok(*price);
        }

        self.config
            .default_model_ratio
            .map(|ratio| ModelPrice {
                ratio,
                completion_ratio: 1.0,
                price: None,
            })
            .ok_or_else(|| LedgerError::UnpricedModel(model.to_owned()))
    }

    pub fn model_ratio(&self, model: &str) -> Result<f64, LedgerError> {
        self.model_price(model).map(|price| price.ratio)
    }

    /// Estimated cost of a request before it runs
    pub fn quote(
        &self,
        model: &str,
        group: &str,
        prompt_tokens: u32,
        max_tokens: Option<u32>,
    ) -> Result<Quote, LedgerError> {
        let price = self.model_price(model)?;
        let group_ratio = self.group_ratio(group);

        if let Some(fixed) = price.price {
            return Ok(Quote {
                amount: to_quota(fixed * self.config.quota_per_unit * group_ratio),
                model_ratio: price.ratio,
                completion_ratio: price.completion_ratio,
                group_ratio,
                fixed_price: true,
            });
        }

        let tokens = u64::from(prompt_tokens) + u64::from(max_tokens.unwrap_or(self.config.preconsume_tokens));

        Ok(Quote {
            amount: to_quota(as_f64(tokens) * price.ratio * group_ratio),
            model_ratio: price.ratio,
            completion_ratio: price.completion_ratio,
            group_ratio,
            fixed_price: false,
        })
    }

    /// Actual cost of a completed call
    ///
    /// Per-call prices keep the quoted amount. Token prices never round a
    /// priced call down to zero.
    pub fn actual(quote: &Quote, usage: &Usage) -> i64 {
        if quote.fixed_price {
            return quote.amount;
        }

        let ratio = quote.model_ratio * quote.group_ratio;
        let weighted = f64::from(usage.prompt_tokens) + f64::from(usage.completion_tokens) * quote.completion_ratio;
        let amount = to_quota(weighted * ratio);

        if ratio.abs() > f64::EPSILON && amount <= 0 { 1 } else { amount }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_quota(value: f64) -> i64 {
    value.round().max(0.0) as i64
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(value: u64) -> f64 {
    value as f64
}

/// Rough prompt size of a chat request, four characters per token
pub fn estimate_prompt_tokens(body: &Value) -> u32 {
    let chars: usize = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| messages.iter().map(message_chars).sum())
        .unwrap_or_default();

    u32::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

fn message_chars(message: &Value) -> usize {
    match message.get("content") {
        Some(Value::String(text)) => text.chars().count(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(|text| text.chars().count())
            .sum(),
        _ => 0,
    }
}
