//! Heartbeat tracking for WebSocket connections.
//!
//! Tracks ping/pong timing so the connection loop can detect a silent peer.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct HeartbeatState {
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    last_message: Instant,
    waiting_for_pong: bool,
}

/// Heartbeat monitor for one transport.
///
/// Uses tokio's clock so paused-time tests can drive it.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    /// How often to send ping.
    interval: Duration,
    /// How long to wait for pong.
    timeout: Duration,
    state: Mutex<HeartbeatState>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            state: Mutex::new(HeartbeatState {
                last_ping: None,
                last_pong: None,
                last_message: Instant::now(),
                waiting_for_pong: false,
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reset heartbeat state (called on connection).
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.last_ping = None;
        state.last_pong = None;
        state.last_message = Instant::now();
        state.waiting_for_pong = false;
    }

    pub fn record_ping(&self) {
        let mut state = self.state.lock();
        state.last_ping = Some(Instant::now());
        state.waiting_for_pong = true;
    }

    pub fn record_pong(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.last_pong = Some(now);
        state.waiting_for_pong = false;

        if let Some(ping_time) = state.last_ping {
            debug!(rtt_ms = (now - ping_time).as_millis() as u64, "Received pong");
        }
    }

    pub fn record_message(&self) {
        self.state.lock().last_message = Instant::now();
    }

    pub fn is_waiting_for_pong(&self) -> bool {
        self.state.lock().waiting_for_pong
    }

    /// Instant by which a pong must arrive, if one is outstanding.
    pub fn pong_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        if !state.waiting_for_pong {
            return None;
        }
        state.last_ping.map(|t| t + self.timeout)
    }

    pub fn is_timed_out(&self) -> bool {
        self.pong_deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn stats(&self) -> HeartbeatStats {
        let state = self.state.lock();
        HeartbeatStats {
            last_ping: state.last_ping,
            last_pong: state.last_pong,
            waiting_for_pong: state.waiting_for_pong,
            since_last_message: state.last_message.elapsed(),
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    pub last_ping: Option<Instant>,
    pub last_pong: Option<Instant>,
    pub waiting_for_pong: bool,
    pub since_last_message: Duration,
}
