//! Model pricing and monetary conversions.
//!
//! All internal accounting is in integer micro-dollars; floating-point USD
//! only appears at the JSON boundary and is validated on the way in.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Clone, Copy, Debug)]
pub struct ModelRate {
    pub input_usd_micros_per_token: u64,
    pub output_usd_micros_per_token: u64,
}

/// Per-model token rates, loadable from LiteLLM-format pricing JSON.
#[derive(Clone, Debug, Default)]
pub struct Pricing {
    models: HashMap<String, ModelRate>,
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("invalid pricing json: expected object at root")]
    InvalidRoot,
    #[error("invalid pricing entry for model {model}: expected object")]
    InvalidModelEntry { model: String },
    #[error("invalid pricing entry for model {model}: no input or output cost")]
    MissingCosts { model: String },
    #[error("invalid pricing entry for model {model}: bad value for {field}")]
    InvalidCostValue { model: String, field: &'static str },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Pricing {
    pub fn from_litellm_json_str(raw: &str) -> Result<Self, PricingError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let Some(root) = value.as_object() else {
            return Err(PricingError::InvalidRoot);
        };

        let mut models = HashMap::new();
        for (model, entry) in root {
            let Some(obj) = entry.as_object() else {
                return Err(PricingError::InvalidModelEntry {
                    model: model.clone(),
                });
            };

            let input = parse_per_token_usd(obj, "input_cost_per_token", "input_cost_per_1k_tokens");
            let output =
                parse_per_token_usd(obj, "output_cost_per_token", "output_cost_per_1k_tokens");
            if input.is_none() && output.is_none() {
                return Err(PricingError::MissingCosts {
                    model: model.clone(),
                });
            }

            models.insert(
                model.clone(),
                ModelRate {
                    input_usd_micros_per_token: rate_micros(input, model, "input_cost")?,
                    output_usd_micros_per_token: rate_micros(output, model, "output_cost")?,
                },
            );
        }

        Ok(Self { models })
    }

    pub fn rate(&self, model: &str) -> Option<ModelRate> {
        self.models.get(model).copied()
    }

    pub fn cost_usd_micros(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Option<u64> {
        let rate = self.rate(model)?;
        let input = input_tokens.saturating_mul(rate.input_usd_micros_per_token);
        let output = output_tokens.saturating_mul(rate.output_usd_micros_per_token);
        Some(input.saturating_add(output))
    }
}

fn parse_per_token_usd(
    obj: &serde_json::Map<String, serde_json::Value>,
    per_token_key: &str,
    per_1k_key: &str,
) -> Option<f64> {
    if let Some(usd) = obj.get(per_token_key).and_then(|value| value.as_f64()) {
        return Some(usd);
    }
    obj.get(per_1k_key)
        .and_then(|value| value.as_f64())
        .map(|per_1k| per_1k / 1000.0)
}

fn rate_micros(
    usd_per_token: Option<f64>,
    model: &str,
    field: &'static str,
) -> Result<u64, PricingError> {
    let Some(usd) = usd_per_token else {
        return Ok(0);
    };
    usd_to_micros(usd).ok_or_else(|| PricingError::InvalidCostValue {
        model: model.to_string(),
        field,
    })
}

/// Converts a USD amount to micro-dollars, rejecting negative or non-finite
/// input. Values beyond the `u64` range saturate.
pub fn usd_to_micros(usd: f64) -> Option<u64> {
    if !usd.is_finite() || usd < 0.0 {
        return None;
    }
    let micros = (usd * 1_000_000.0).round();
    if micros > u64::MAX as f64 {
        return Some(u64::MAX);
    }
    Some(micros as u64)
}

pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_litellm_pricing_json() {
        let raw = r#"{
          "gpt-4o-mini": {"input_cost_per_token": 0.000001, "output_cost_per_token": 0.000002},
          "o1": {"input_cost_per_1k_tokens": 1.0, "output_cost_per_1k_tokens": 2.0}
        }"#;
        let pricing = Pricing::from_litellm_json_str(raw).expect("pricing");

        let mini = pricing.rate("gpt-4o-mini").expect("rate");
        assert_eq!(mini.input_usd_micros_per_token, 1);
        assert_eq!(mini.output_usd_micros_per_token, 2);

        let o1 = pricing.rate("o1").expect("rate");
        assert_eq!(o1.input_usd_micros_per_token, 1000);
        assert_eq!(o1.output_usd_micros_per_token, 2000);

        let cost = pricing
            .cost_usd_micros("gpt-4o-mini", 3, 4)
            .expect("cost");
        assert_eq!(cost, 3 + 8);
        assert!(pricing.cost_usd_micros("unknown-model", 1, 1).is_none());
    }

    #[test]
    fn rejects_negative_rates() {
        let raw = r#"{"bad": {"input_cost_per_token": -0.5}}"#;
        let err = Pricing::from_litellm_json_str(raw).expect_err("reject");
        assert!(matches!(err, PricingError::InvalidCostValue { .. }));
    }

    #[test]
    fn usd_conversion_guards_input() {
        assert_eq!(usd_to_micros(10.0), Some(10_000_000));
        assert_eq!(usd_to_micros(0.0), Some(0));
        assert_eq!(usd_to_micros(-1.0), None);
        assert_eq!(usd_to_micros(f64::NAN), None);
        assert_eq!(usd_to_micros(f64::INFINITY), None);
        assert_eq!(micros_to_usd(9_990_000), 9.99);
    }
}
