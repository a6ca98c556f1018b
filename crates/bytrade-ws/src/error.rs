//! WebSocket error types.

use bytrade_core::SignerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Auth failed: {0}")]
    AuthFailed(String),

    #[error("Reconnect requested: {0}")]
    ReconnectRequested(String),

    #[error("Transport closed")]
    Closed,

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WsError {
    /// Errors that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidUrl(_))
    }

    /// Label used for the reconnect counter.
    pub fn reason_label(&self) -> &'static str {
        match self {
            Self::ConnectionClosed { .. } => "closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ReconnectRequested(_) => "requested",
            Self::Tungstenite(_) | Self::ConnectionFailed(_) => "io",
            _ => "other",
        }
    }
}

pub type WsResult<T> = Result<T, WsError>;
