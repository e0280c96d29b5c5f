//! Authenticated gateway in front of an LLM completion backend.
//!
//! Every inbound request is checked against its API key's spending budget,
//! the actual cost of the call is recorded atomically once the backend
//! responds, and cost-reporting endpoints expose consistent read and reset
//! operations on the accumulated spend.

pub mod admission;
pub mod costing;
mod error;
pub mod gateway;
pub mod http;
pub mod http_backend;
pub mod issuance;
pub mod keys;
pub mod ledger;
#[cfg(feature = "store-redis")]
pub mod redis_store;
pub mod state_file;

pub use admission::AdmissionController;
pub use costing::{Pricing, PricingError, micros_to_usd, usd_to_micros};
pub use error::{GatewayError, Result};
pub use gateway::{
    Backend, CACHE_HINT_HEADER_PREFIX, CompletionOutcome, CompletionRequest, Gateway,
    ObservabilitySnapshot,
};
pub use http::{GatewayHttpState, router};
pub use http_backend::HttpBackend;
pub use keys::{ApiKey, BudgetPolicy, KeyStore, ResetPeriod};
pub use ledger::{CostLedger, LedgerEntry, MemoryLedger};
#[cfg(feature = "store-redis")]
pub use redis_store::RedisStore;
pub use state_file::{KeyStateFile, KeyStateFileError};
