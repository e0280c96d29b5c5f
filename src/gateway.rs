//! Per-request orchestration: authenticate, admit, invoke, record, respond.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::admission::AdmissionController;
use crate::error::GatewayError;
use crate::keys::KeyStore;
use crate::ledger::CostLedger;

/// Reserved header marker. Inbound headers carrying this prefix are forwarded
/// to the backend as opaque cache hints; the gateway never interprets them.
pub const CACHE_HINT_HEADER_PREFIX: &str = "x-spendgate-";

/// Transient per-request context; constructed at entry, never persisted.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub token: String,
    pub model: String,
    pub payload: Value,
    pub cache_hints: BTreeMap<String, String>,
}

/// What a successful backend call came back with: the response body plus the
/// accounting record needed to charge the ledger.
#[derive(Clone, Debug)]
pub struct CompletionOutcome {
    pub body: Value,
    pub model: String,
    pub cost_usd_micros: u64,
}

/// The external completion collaborator. May take arbitrarily long and may
/// fail independently of budget state.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest)
    -> Result<CompletionOutcome, GatewayError>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub unauthorized: u64,
    pub budget_exceeded: u64,
    pub backend_calls: u64,
    pub backend_errors: u64,
    pub completions: u64,
}

#[derive(Debug, Default)]
struct Observability {
    requests: AtomicU64,
    unauthorized: AtomicU64,
    budget_exceeded: AtomicU64,
    backend_calls: AtomicU64,
    backend_errors: AtomicU64,
    completions: AtomicU64,
}

impl Observability {
    fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
            budget_exceeded: self.budget_exceeded.load(Ordering::Relaxed),
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct Gateway {
    keys: Arc<KeyStore>,
    ledger: Arc<dyn CostLedger>,
    admission: AdmissionController,
    backend: Arc<dyn Backend>,
    observability: Observability,
}

impl Gateway {
    pub fn new(keys: Arc<KeyStore>, ledger: Arc<dyn CostLedger>, backend: Arc<dyn Backend>) -> Self {
        let admission = AdmissionController::new(Arc::clone(&keys), Arc::clone(&ledger));
        Self {
            keys,
            ledger,
            admission,
            backend,
            observability: Observability::default(),
        }
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn ledger(&self) -> &Arc<dyn CostLedger> {
        &self.ledger
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    /// Runs one request through the full lifecycle. Authentication and
    /// admission failures are terminal and never reach the backend; a backend
    /// failure charges nothing. On success the cost is recorded before the
    /// response is returned, so the next admission check on this key observes
    /// it. No lock is held across the backend call.
    pub async fn handle(&self, request: CompletionRequest) -> Result<Value, GatewayError> {
        bump(&self.observability.requests);

        if !self.keys.is_valid(&request.token) {
            bump(&self.observability.unauthorized);
            return Err(GatewayError::Unauthorized);
        }

        if let Err(err) = self.admission.check_admit(&request.token).await {
            if matches!(err, GatewayError::BudgetExceeded { .. }) {
                bump(&self.observability.budget_exceeded);
            }
            return Err(err);
        }

        bump(&self.observability.backend_calls);
        let outcome = match self.backend.complete(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                bump(&self.observability.backend_errors);
                // Failed calls are never charged.
                return Err(err);
            }
        };

        self.ledger
            .record_cost(&request.token, &outcome.model, outcome.cost_usd_micros)
            .await?;
        bump(&self.observability.completions);

        Ok(outcome.body)
    }
}
