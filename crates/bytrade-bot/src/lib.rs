//! bytrade recurring-order bot.
//!
//! Wires the components together:
//! - Authenticated private stream with automatic re-subscribe
//! - Order gateway fed by REST responses and `order` stream events
//! - Recurring market orders on a drift-free schedule
//! - Optional Prometheus scrape endpoint

pub mod app;
pub mod config;
pub mod error;
pub mod metrics_server;

pub use app::Application;
pub use config::{AppConfig, RecurringOrderConfig};
pub use error::{AppError, AppResult};
