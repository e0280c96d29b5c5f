//! The set of issued API keys and their budget policies.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPeriod {
    #[default]
    None,
    Daily,
    Monthly,
}

impl ResetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetPeriod::None => "none",
            ResetPeriod::Daily => "daily",
            ResetPeriod::Monthly => "monthly",
        }
    }
}

/// Attached 1:1 to an API key. The ceiling is fixed at issuance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub total_usd_micros: u64,
    #[serde(default)]
    pub period: ResetPeriod,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub token: String,
    pub policy: BudgetPolicy,
    pub created_at_ms: u64,
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("token", &"<redacted>")
            .field("policy", &self.policy)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

impl ApiKey {
    pub fn new(token: impl Into<String>, policy: BudgetPolicy) -> Self {
        Self {
            token: token.into(),
            policy,
            created_at_ms: now_millis(),
        }
    }
}

/// Process-wide set of valid keys. Lookups and registrations may race from
/// many request tasks; all access goes through the interior lock.
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self, token: &str) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(token)
    }

    pub fn policy_for(&self, token: &str) -> Option<BudgetPolicy> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .map(|key| key.policy)
    }

    /// Tokens are immutable once issued: a duplicate registration means the
    /// entropy source or the backing store is broken, and is surfaced as an
    /// error rather than overwriting the existing key.
    pub fn register(&self, key: ApiKey) -> Result<(), GatewayError> {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if keys.contains_key(&key.token) {
            return Err(GatewayError::DuplicateKey);
        }
        keys.insert(key.token.clone(), key);
        Ok(())
    }

    pub fn list(&self) -> Vec<ApiKey> {
        let mut keys: Vec<ApiKey> = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        keys
    }

    pub fn len(&self) -> usize {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
