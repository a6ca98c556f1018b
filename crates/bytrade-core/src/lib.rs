//! Core domain types for the bytrade exchange session.
//!
//! This crate provides the types shared by the stream and order crates:
//! - `Credential`, `Signer`: HMAC-SHA256 signing of handshakes and REST calls
//! - `Topic`: subscribable stream names
//! - `Order`, `OrderSpec`, `OrderStatus`: the order lifecycle
//! - `Price`, `Size`: precision-safe numeric types
//! - `Clock`: injectable wall clock

pub mod clock;
pub mod credential;
pub mod decimal;
pub mod error;
pub mod order;
pub mod signer;
pub mod topic;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::Credential;
pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use order::{ClientOrderId, Order, OrderSide, OrderSpec, OrderStatus, OrderType, TimeInForce};
pub use signer::{
    build_auth_signature, build_rest_signature, canonicalize, sign, AuthHandshake, HttpMethod,
    SignedRequest, Signer, SignerError, SignerResult, AUTH_VERB_PATH,
};
pub use topic::Topic;
