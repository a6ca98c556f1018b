//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<bytrade_ws::WsError>),

    #[error("Signer error: {0}")]
    Signer(#[from] bytrade_core::SignerError),

    #[error("Core error: {0}")]
    Core(#[from] bytrade_core::CoreError),

    #[error("Executor error: {0}")]
    Executor(#[from] bytrade_executor::ExecutorError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] bytrade_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bytrade_ws::WsError> for AppError {
    fn from(err: bytrade_ws::WsError) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
