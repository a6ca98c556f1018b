//! Executor error types.

use bytrade_core::SignerError;
use std::time::Duration;
use thiserror::Error;

/// `retCode` for an `orderLinkId` the exchange has already seen.
pub const RET_CODE_DUPLICATE_LINK_ID: i64 = 110072;

/// Failure of a single REST call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RestError {
    /// Timeout, connect failure, 5xx or rate limit. Safe to retry.
    #[error("Network error: {0}")]
    Network(String),

    /// The exchange answered with a non-zero `retCode`.
    #[error("Exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    /// The response body could not be decoded.
    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Signing failed: {0}")]
    Signer(#[from] SignerError),
}

impl RestError {
    /// Whether a single retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Decode(_))
    }

    /// The exchange already holds an order with this `orderLinkId`.
    pub fn is_duplicate_link_id(&self) -> bool {
        matches!(self, Self::Exchange { code, .. } if *code == RET_CODE_DUPLICATE_LINK_ID)
    }

    /// Label for the `outcome` metric dimension.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Exchange { .. } => "exchange_error",
            Self::Decode(_) => "decode_error",
            Self::Signer(_) => "signer_error",
        }
    }
}

pub type RestResult<T> = Result<T, RestError>;

/// Errors surfaced by the order gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Invalid order spec: {0}")]
    InvalidOrderSpec(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Exchange rejected: {0}")]
    ExchangeRejected(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("No async runtime: {0}")]
    NoRuntime(String),
}

impl From<RestError> for GatewayError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::Network(msg) => Self::NetworkError(msg),
            RestError::Decode(msg) => Self::NetworkError(format!("malformed response: {msg}")),
            RestError::Exchange { message, .. } => Self::ExchangeRejected(message),
            RestError::Signer(e) => Self::InvalidCredential(e.to_string()),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Invalid schedule interval: {0:?}")]
    InvalidInterval(Duration),

    #[error("No async runtime: {0}")]
    NoRuntime(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
