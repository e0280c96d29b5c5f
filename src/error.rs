use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized api key")]
    Unauthorized,
    #[error(
        "budget exceeded: limit_usd_micros={limit_usd_micros} spent_usd_micros={spent_usd_micros}"
    )]
    BudgetExceeded {
        limit_usd_micros: u64,
        spent_usd_micros: u64,
    },
    #[error("no budget policy registered for key")]
    UnknownKey,
    #[error("invalid cost: {reason}")]
    InvalidCost { reason: String },
    #[error("invalid budget: {reason}")]
    InvalidBudget { reason: String },
    #[error("api key already registered")]
    DuplicateKey,
    #[error("backend error: {message}")]
    Backend { message: String },
    #[error("store error: {message}")]
    Store { message: String },
}

pub type Result<T> = std::result::Result<T, GatewayError>;
