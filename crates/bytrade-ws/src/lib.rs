//! Authenticated WebSocket streaming for the bytrade exchange client.
//!
//! Layers, bottom up:
//! - [`Transport`]: one socket at a time, reconnect with backoff and jitter,
//!   heartbeat, observer fan-out
//! - [`Session`]: signed handshake on every connection, `NotAuthenticated` gate
//! - [`SubscriptionManager`]: desired topic set, re-subscribe after each
//!   handshake, topic routing

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod session;
pub mod subscription;

pub use connection::{
    backoff_delay, ConnectionState, MessageHandler, StateHandler, Transport, TransportConfig,
};
pub use error::{WsError, WsResult};
pub use heartbeat::{HeartbeatMonitor, HeartbeatStats};
pub use message::{
    OpMessage, OrderUpdate, OrderUpdatesResult, TopicMessage, WsMessage, WsRequest, ORDER_TOPIC,
};
pub use session::{AuthHandler, AuthResult, AuthStatus, Session, SessionConfig};
pub use subscription::{SubscriptionHealth, SubscriptionManager, TopicHandler, TopicMatcher};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
