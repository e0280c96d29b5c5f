//! Shared key/ledger storage in Redis, for multi-instance deployments.
//!
//! Ledger atomicity is delegated to Redis: every read-modify-write runs as a
//! single `MULTI`/`EXEC` pipeline against the per-key hash, so concurrent
//! increments on one key serialize in the store while distinct keys never
//! contend inside this process.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::GatewayError;
use crate::keys::{ApiKey, now_millis};
use crate::ledger::{CostLedger, LedgerEntry};

const TOTAL_FIELD: &str = "total_usd_micros";
const LAST_RESET_FIELD: &str = "last_reset_ms";
const UPDATED_AT_FIELD: &str = "updated_at_ms";
const MODEL_FIELD_PREFIX: &str = "model:";

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::Store {
            message: format!("redis error: {err}"),
        }
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, GatewayError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "spendgate".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn key_ledger(&self, token: &str) -> String {
        format!("{}:cost_ledger:{token}", self.prefix)
    }

    fn key_api_keys(&self) -> String {
        format!("{}:api_keys", self.prefix)
    }

    /// Registers a key in the shared store. `HSETNX` preserves the immutable
    /// token invariant across gateway instances: a second writer loses and
    /// sees `DuplicateKey`.
    pub async fn save_key(&self, key: &ApiKey) -> Result<(), GatewayError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(key).map_err(|err| GatewayError::Store {
            message: format!("serialize api key failed: {err}"),
        })?;
        let inserted: bool = conn
            .hset_nx(self.key_api_keys(), &key.token, payload)
            .await?;
        if !inserted {
            return Err(GatewayError::DuplicateKey);
        }
        Ok(())
    }

    pub async fn load_keys(&self) -> Result<Vec<ApiKey>, GatewayError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.key_api_keys()).await?;
        let mut keys = Vec::with_capacity(raw.len());
        for (token, payload) in raw {
            let key: ApiKey =
                serde_json::from_str(&payload).map_err(|err| GatewayError::Store {
                    message: format!("corrupt api key record for {}…: {err}", redact(&token)),
                })?;
            keys.push(key);
        }
        keys.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        Ok(keys)
    }
}

#[async_trait]
impl CostLedger for RedisStore {
    async fn current_spend(&self, token: &str) -> Result<LedgerEntry, GatewayError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.key_ledger(token)).await?;

        let mut entry = LedgerEntry {
            total_usd_micros: parse_field(&raw, TOTAL_FIELD),
            last_reset_ms: parse_field(&raw, LAST_RESET_FIELD),
            ..LedgerEntry::default()
        };
        for (field, value) in &raw {
            let Some(model) = field.strip_prefix(MODEL_FIELD_PREFIX) else {
                continue;
            };
            entry
                .per_model
                .insert(model.to_string(), value.parse::<u64>().unwrap_or(0));
        }
        Ok(entry)
    }

    async fn record_cost(
        &self,
        token: &str,
        model: &str,
        usd_micros: u64,
    ) -> Result<(), GatewayError> {
        let mut conn = self.connection().await?;
        let ledger_key = self.key_ledger(token);
        let delta = micros_to_i64(usd_micros);
        let _: () = redis::pipe()
            .atomic()
            .hincr(&ledger_key, TOTAL_FIELD, delta)
            .hincr(&ledger_key, format!("{MODEL_FIELD_PREFIX}{model}"), delta)
            .hset(&ledger_key, UPDATED_AT_FIELD, now_millis())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reset(&self, token: &str) -> Result<LedgerEntry, GatewayError> {
        let mut conn = self.connection().await?;
        let ledger_key = self.key_ledger(token);
        let ts_ms = now_millis();
        let _: () = redis::pipe()
            .atomic()
            .del(&ledger_key)
            .hset(&ledger_key, LAST_RESET_FIELD, ts_ms)
            .hset(&ledger_key, UPDATED_AT_FIELD, ts_ms)
            .query_async(&mut conn)
            .await?;
        Ok(LedgerEntry {
            last_reset_ms: ts_ms,
            ..LedgerEntry::default()
        })
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }
}

fn parse_field(raw: &HashMap<String, String>, field: &str) -> u64 {
    raw.get(field)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0)
}

fn micros_to_i64(micros: u64) -> i64 {
    micros.min(i64::MAX as u64) as i64
}

fn redact(token: &str) -> String {
    token.chars().take(8).collect()
}
