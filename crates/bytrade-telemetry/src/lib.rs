//! Prometheus metrics and structured logging for bytrade.
//!
//! - Prometheus metrics for connection, auth, subscription and order flow
//! - Structured logging with tracing (JSON in production)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
