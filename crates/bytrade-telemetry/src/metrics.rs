//! Prometheus metrics for bytrade.
//!
//! Covers:
//! - Connection state and reconnects
//! - Auth handshake outcomes
//! - Subscription health (unmatched messages, rejected topics)
//! - Order lifecycle transitions and REST outcomes
//! - Scheduled job runs
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_int_counter,
    register_int_gauge, CounterVec, Encoder, Gauge, GaugeVec, IntCounter, IntGauge, TextEncoder,
};

/// WebSocket connection state (1 = connected, 0 = disconnected).
pub static WS_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "bytrade_ws_connected",
        "WebSocket connection state (1=connected)"
    )
    .unwrap()
});

/// WebSocket state machine current state.
/// Labels: state (disconnected/connecting/connected/authenticating/authenticated/closing)
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "bytrade_ws_state",
        "WebSocket state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Total WebSocket reconnection attempts.
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bytrade_ws_reconnect_total",
        "Total WebSocket reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Auth handshake outcomes.
/// Labels: result (success/failure)
pub static WS_AUTH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bytrade_ws_auth_total",
        "Total auth handshake outcomes",
        &["result"]
    )
    .unwrap()
});

/// Inbound topic messages with no registered handler.
pub static WS_UNMATCHED_MESSAGES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "bytrade_ws_unmatched_messages_total",
        "Inbound topic messages that matched no handler"
    )
    .unwrap()
});

/// Topics the exchange refused to subscribe.
pub static SUBSCRIPTION_REJECTED_TOPICS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "bytrade_subscription_rejected_topics",
        "Number of desired topics currently rejected by the exchange"
    )
    .unwrap()
});

/// Order status transitions.
/// Labels: status (pending/submitted/acknowledged/partially_filled/filled/cancelled/rejected)
pub static ORDER_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bytrade_order_transitions_total",
        "Total order status transitions applied",
        &["status"]
    )
    .unwrap()
});

/// REST request outcomes.
/// Labels: endpoint, outcome (ok/network_error/exchange_error)
pub static REST_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bytrade_rest_requests_total",
        "Total REST requests by endpoint and outcome",
        &["endpoint", "outcome"]
    )
    .unwrap()
});

/// Scheduled job runs.
/// Labels: outcome (ok/error/panic)
pub static SCHEDULED_RUNS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bytrade_scheduled_runs_total",
        "Total scheduled job runs by outcome",
        &["outcome"]
    )
    .unwrap()
});

const WS_STATES: [&str; 6] = [
    "disconnected",
    "connecting",
    "connected",
    "authenticating",
    "authenticated",
    "closing",
];

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Record WebSocket connected.
    pub fn ws_connected() {
        WS_CONNECTED.set(1.0);
    }

    /// Record WebSocket disconnected.
    pub fn ws_disconnected() {
        WS_CONNECTED.set(0.0);
    }

    /// Set WebSocket state machine state.
    /// Only the active state should be set to 1, all others to 0.
    pub fn ws_state_set(state: &str) {
        for s in &WS_STATES {
            WS_STATE.with_label_values(&[s]).set(0.0);
        }
        WS_STATE.with_label_values(&[state]).set(1.0);
    }

    /// Record WebSocket reconnection.
    pub fn ws_reconnect(reason: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn ws_auth(success: bool) {
        let result = if success { "success" } else { "failure" };
        WS_AUTH_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn ws_unmatched_message() {
        WS_UNMATCHED_MESSAGES_TOTAL.inc();
    }

    pub fn subscription_rejected_set(count: usize) {
        SUBSCRIPTION_REJECTED_TOPICS.set(count as i64);
    }

    pub fn order_transition(status: &str) {
        ORDER_TRANSITIONS_TOTAL.with_label_values(&[status]).inc();
    }

    pub fn rest_request(endpoint: &str, outcome: &str) {
        REST_REQUESTS_TOTAL
            .with_label_values(&[endpoint, outcome])
            .inc();
    }

    pub fn scheduled_run(outcome: &str) {
        SCHEDULED_RUNS_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let families = prometheus::gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
