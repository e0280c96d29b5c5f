//! Completion backend that forwards the request payload upstream over HTTP.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::costing::{Pricing, usd_to_micros};
use crate::error::GatewayError;
use crate::gateway::{Backend, CompletionOutcome, CompletionRequest};

const MAX_BACKEND_ERROR_BODY_BYTES: usize = 64 * 1024;

pub struct HttpBackend {
    url: String,
    client: reqwest::Client,
    headers: BTreeMap<String, String>,
    pricing: Pricing,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| GatewayError::Backend {
                message: format!("backend http client error: {err}"),
            })?;
        Ok(Self {
            url: url.into(),
            client,
            headers: BTreeMap::new(),
            pricing: Pricing::default(),
        })
    }

    /// Fixed headers sent with every upstream call (auth, routing hints).
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// The accounting record for a response: an explicit `cost_usd` field
    /// wins; otherwise the usage block is priced with the configured table.
    /// A model absent from the table is charged as zero.
    fn cost_usd_micros(&self, model: &str, body: &Value) -> Result<u64, GatewayError> {
        if let Some(cost_usd) = body.get("cost_usd") {
            let cost_usd = cost_usd
                .as_f64()
                .ok_or_else(|| GatewayError::InvalidCost {
                    reason: "cost_usd is not a number".to_string(),
                })?;
            return usd_to_micros(cost_usd).ok_or_else(|| GatewayError::InvalidCost {
                reason: format!("cost_usd must be a non-negative finite number, got {cost_usd}"),
            });
        }

        let usage: UpstreamUsage = body
            .get("usage")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| GatewayError::InvalidCost {
                reason: format!("malformed usage block: {err}"),
            })?
            .unwrap_or_default();

        Ok(self
            .pricing
            .cost_usd_micros(model, usage.prompt_tokens, usage.completion_tokens)
            .unwrap_or(0))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionOutcome, GatewayError> {
        let mut req = self.client.post(&self.url).json(&request.payload);
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        // Cache hints ride along as headers, uninterpreted.
        for (name, value) in &request.cache_hints {
            req = req.header(name, value);
        }

        let response = req.send().await.map_err(|err| GatewayError::Backend {
            message: format!("backend request failed: {err}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(MAX_BACKEND_ERROR_BODY_BYTES);
            return Err(GatewayError::Backend {
                message: format!("backend status {status}: {body}"),
            });
        }

        let body: Value = response.json().await.map_err(|err| GatewayError::Backend {
            message: format!("backend response decode error: {err}"),
        })?;

        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_string();
        let cost_usd_micros = self.cost_usd_micros(&model, &body)?;

        Ok(CompletionOutcome {
            body,
            model,
            cost_usd_micros,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend_with_pricing() -> HttpBackend {
        let pricing = Pricing::from_litellm_json_str(
            r#"{"gpt-4o-mini": {"input_cost_per_token": 0.000001, "output_cost_per_token": 0.000002}}"#,
        )
        .expect("pricing");
        HttpBackend::new("http://127.0.0.1:0/chat/completions")
            .expect("backend")
            .with_pricing(pricing)
    }

    #[test]
    fn explicit_cost_field_wins() {
        let backend = backend_with_pricing();
        let body = json!({"cost_usd": 0.25, "usage": {"prompt_tokens": 1000, "completion_tokens": 1000}});
        assert_eq!(
            backend.cost_usd_micros("gpt-4o-mini", &body).expect("cost"),
            250_000
        );
    }

    #[test]
    fn usage_is_priced_when_no_explicit_cost() {
        let backend = backend_with_pricing();
        let body = json!({"usage": {"prompt_tokens": 100, "completion_tokens": 50}});
        assert_eq!(
            backend.cost_usd_micros("gpt-4o-mini", &body).expect("cost"),
            100 + 100
        );
    }

    #[test]
    fn negative_cost_is_rejected() {
        let backend = backend_with_pricing();
        let body = json!({"cost_usd": -0.5});
        let err = backend
            .cost_usd_micros("gpt-4o-mini", &body)
            .expect_err("reject");
        assert!(matches!(err, GatewayError::InvalidCost { .. }));
    }

    #[test]
    fn unpriced_model_charges_zero() {
        let backend = backend_with_pricing();
        let body = json!({"usage": {"prompt_tokens": 10, "completion_tokens": 10}});
        assert_eq!(
            backend.cost_usd_micros("some-new-model", &body).expect("cost"),
            0
        );
    }
}
