//! Per-key cost accounting: the single source of truth for accumulated spend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::keys::now_millis;

/// Accumulated spend for one key. Totals only ever grow between resets; a
/// reset zeroes both the total and the per-model breakdown.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub total_usd_micros: u64,
    pub per_model: BTreeMap<String, u64>,
    pub last_reset_ms: u64,
}

/// Atomic read/increment/reset operations on per-key spend.
///
/// Implementations serialize `record_cost` and `reset` per key: two
/// concurrent increments always both land, and a reset racing an increment
/// resolves to one consistent order, never a partial state. Operations on
/// distinct keys must not contend with each other.
#[async_trait]
pub trait CostLedger: Send + Sync {
    /// Reading never fails for a valid key: an absent entry is a zero entry.
    async fn current_spend(&self, token: &str) -> Result<LedgerEntry, GatewayError>;

    /// Adds `usd_micros` to both the total and the per-model bucket in one
    /// atomic step.
    async fn record_cost(&self, token: &str, model: &str, usd_micros: u64)
    -> Result<(), GatewayError>;

    /// Zeroes the entry and stamps `last_reset_ms`; returns the zeroed entry.
    async fn reset(&self, token: &str) -> Result<LedgerEntry, GatewayError>;

    /// Backing-store reachability, surfaced by the health endpoint.
    async fn ping(&self) -> Result<(), GatewayError>;
}

/// In-process ledger for single-instance deployments.
///
/// The outer map is only write-locked to insert a missing entry; all
/// read-modify-write happens under the per-key mutex, so keys never contend
/// with each other on the hot path.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: RwLock<HashMap<String, Arc<Mutex<LedgerEntry>>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, token: &str) -> Arc<Mutex<LedgerEntry>> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
        {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(token.to_string()).or_default())
    }
}

#[async_trait]
impl CostLedger for MemoryLedger {
    async fn current_spend(&self, token: &str) -> Result<LedgerEntry, GatewayError> {
        let entry = self.entry(token);
        let entry = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entry.clone())
    }

    async fn record_cost(
        &self,
        token: &str,
        model: &str,
        usd_micros: u64,
    ) -> Result<(), GatewayError> {
        let entry = self.entry(token);
        let mut entry = entry.lock().unwrap_or_else(PoisonError::into_inner);
        entry.total_usd_micros = entry.total_usd_micros.saturating_add(usd_micros);
        let bucket = entry.per_model.entry(model.to_string()).or_insert(0);
        *bucket = bucket.saturating_add(usd_micros);
        Ok(())
    }

    async fn reset(&self, token: &str) -> Result<LedgerEntry, GatewayError> {
        let entry = self.entry(token);
        let mut entry = entry.lock().unwrap_or_else(PoisonError::into_inner);
        entry.total_usd_micros = 0;
        entry.per_model.clear();
        entry.last_reset_ms = now_millis();
        Ok(entry.clone())
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}
