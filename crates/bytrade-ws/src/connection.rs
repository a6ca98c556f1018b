//! WebSocket transport.
//!
//! Handles connection lifecycle, automatic reconnection with exponential backoff,
//! application-level heartbeat, and fan-out of inbound frames and state changes
//! to registered observers.
//!
//! The socket is owned by a single background task. Everything else talks to it
//! through an outbound channel and observer lists, so inbound delivery is
//! sequential and in wire order.

use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::message::{WsMessage, WsRequest};
use bytrade_telemetry::Metrics;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async_tls_with_config;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL.
    pub url: String,
    /// Maximum consecutive reconnection attempts (0 = infinite).
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    pub reconnect_jitter_ms: u64,
    /// A connection that lived this long resets the backoff attempt counter.
    pub stability_threshold_ms: u64,
    /// Heartbeat interval.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat timeout (pong must arrive within this).
    pub heartbeat_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_reconnect_attempts: 0, // Infinite
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
            reconnect_jitter_ms: 1000,
            stability_threshold_ms: 30000,
            heartbeat_interval_ms: 20000,
            heartbeat_timeout_ms: 10000,
        }
    }
}

/// Connection state.
///
/// The transport itself only moves between `Disconnected`, `Connecting`,
/// `Connected` and `Closing`; a session refines `Connected` into
/// `Authenticating` and `Authenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer for raw inbound text frames.
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;
/// Observer for transport state changes.
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// WebSocket transport.
pub struct Transport {
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    heartbeat: HeartbeatMonitor,
    message_handlers: RwLock<Vec<MessageHandler>>,
    state_handlers: RwLock<Vec<StateHandler>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    /// Consumed by the connection task only.
    outbound_rx: TokioMutex<mpsc::UnboundedReceiver<String>>,
    reconnect_count: AtomicU32,
    reconnect_notify: Notify,
    reconnect_reason: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
    /// Cancelled by `close()`.
    shutdown_token: CancellationToken,
    /// Cancelled once the connection task has exited for good.
    stopped_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let heartbeat = HeartbeatMonitor::new(
            Duration::from_millis(config.heartbeat_interval_ms),
            Duration::from_millis(config.heartbeat_timeout_ms),
        );
        Arc::new(Self {
            config,
            state_tx,
            heartbeat,
            message_handlers: RwLock::new(Vec::new()),
            state_handlers: RwLock::new(Vec::new()),
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            reconnect_count: AtomicU32::new(0),
            reconnect_notify: Notify::new(),
            reconnect_reason: Mutex::new(None),
            last_error: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
            stopped_token: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Total reconnections since creation.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// Whether the connection task has exited (closed, or gave up).
    pub fn is_stopped(&self) -> bool {
        self.stopped_token.is_cancelled()
    }

    /// Resolves once the connection task has exited for good.
    pub async fn stopped(&self) {
        self.stopped_token.cancelled().await;
    }

    /// Register an observer for inbound text frames.
    ///
    /// Observers run on the connection task in registration order and must
    /// not block.
    pub fn on_message(&self, handler: MessageHandler) {
        self.message_handlers.write().push(handler);
    }

    /// Register an observer for state changes.
    pub fn on_state_change(&self, handler: StateHandler) {
        self.state_handlers.write().push(handler);
    }

    /// Queue a text frame for the current connection.
    pub fn send(&self, text: String) -> WsResult<()> {
        if !self.is_connected() {
            return Err(WsError::NotConnected);
        }
        self.outbound_tx.send(text).map_err(|_| WsError::Closed)
    }

    /// Force the current connection down. The reconnect policy applies.
    pub fn request_reconnect(&self, reason: &str) {
        if !self.is_connected() {
            debug!(%reason, "Reconnect requested while not connected, ignoring");
            return;
        }
        *self.reconnect_reason.lock() = Some(reason.to_string());
        self.reconnect_notify.notify_one();
    }

    /// Start the connection task and wait for the first successful connection.
    ///
    /// Fails only on errors retrying cannot fix: an invalid URL, exhausting
    /// `max_reconnect_attempts`, or `close()` before any connection was made.
    /// Calling it again while running waits for the next `Connected`.
    pub async fn connect(self: &Arc<Self>) -> WsResult<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(WsError::Closed);
        }

        let mut state_rx = self.state_tx.subscribe();
        {
            let mut task = self.task.lock();
            if task.is_none() && !self.is_stopped() {
                let this = Arc::clone(self);
                *task = Some(tokio::spawn(async move { this.run().await }));
            }
        }

        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Connected {
                return Ok(());
            }
            if self.is_stopped() {
                return Err(self.terminal_error());
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(WsError::Closed);
                    }
                }
                () = self.stopped_token.cancelled() => {}
            }
        }
    }

    /// Close the transport. Idempotent; no reconnect follows.
    pub async fn close(&self) {
        if !self.shutdown_token.is_cancelled() {
            info!("Transport close requested");
        }
        self.shutdown_token.cancel();

        let handle = self.task.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(?e, "Connection task ended abnormally");
                }
            }
            None => {
                self.set_state(ConnectionState::Disconnected);
                self.stopped_token.cancel();
            }
        }
    }

    fn terminal_error(&self) -> WsError {
        if self.shutdown_token.is_cancelled() {
            return WsError::Closed;
        }
        match self.last_error.lock().clone() {
            Some(e) => WsError::ConnectionFailed(e),
            None => WsError::Closed,
        }
    }

    async fn run(self: Arc<Self>) {
        let mut outbound_rx = self.outbound_rx.lock().await;
        let stability = Duration::from_millis(self.config.stability_threshold_ms);
        let mut attempt = 0u32;

        loop {
            if self.shutdown_token.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let (connected_for, result) = self.try_connect(&mut outbound_rx).await;

            if self.shutdown_token.is_cancelled() {
                info!("Shutdown requested, not reconnecting");
                break;
            }
            self.set_state(ConnectionState::Disconnected);

            match result {
                Ok(()) => info!("WebSocket connection closed"),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Unrecoverable connection error");
                    *self.last_error.lock() = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "WebSocket connection lost");
                    Metrics::ws_reconnect(e.reason_label());
                    *self.last_error.lock() = Some(e.to_string());
                }
            }

            if connected_for.is_some_and(|d| d >= stability) {
                attempt = 0;
            }
            attempt += 1;
            self.reconnect_count.fetch_add(1, Ordering::SeqCst);

            if self.config.max_reconnect_attempts > 0
                && attempt >= self.config.max_reconnect_attempts
            {
                error!(attempt, "Max reconnection attempts reached");
                *self.last_error.lock() = Some("Max reconnection attempts reached".to_string());
                break;
            }

            let delay = backoff_delay(
                self.config.reconnect_base_delay_ms,
                self.config.reconnect_max_delay_ms,
                attempt,
            ) + Duration::from_millis(rand_jitter(self.config.reconnect_jitter_ms));
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown requested during backoff, exiting");
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.stopped_token.cancel();
    }

    /// Run one connection until it ends.
    ///
    /// Returns how long the connection was up (if it came up at all) and why
    /// it ended. `Ok(())` means shutdown was requested.
    async fn try_connect(
        &self,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> (Option<Duration>, WsResult<()>) {
        info!(url = %self.config.url, "Connecting to WebSocket");

        // TCP_NODELAY: frames are small and latency-sensitive
        let ws_stream = tokio::select! {
            res = connect_async_tls_with_config(self.config.url.as_str(), None, true, None) => {
                match res {
                    Ok((stream, _response)) => stream,
                    Err(e) => return (None, Err(classify_connect_error(e))),
                }
            }
            () = self.shutdown_token.cancelled() => return (None, Ok(())),
        };
        let (mut write, mut read) = ws_stream.split();

        let mut stale = 0usize;
        while outbound_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "Discarded frames queued for the previous connection");
        }
        *self.reconnect_reason.lock() = None;
        self.heartbeat.reset();

        let connected_at = Instant::now();
        info!("WebSocket connected");
        self.set_state(ConnectionState::Connected);

        let interval = self.heartbeat.interval();
        let mut ping_timer = tokio::time::interval_at(connected_at + interval, interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            let pong_deadline = self.heartbeat.pong_deadline();

            tokio::select! {
                biased;

                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received in message loop");
                    self.set_state(ConnectionState::Closing);
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(?e, "Failed to send Close frame during shutdown");
                    }
                    break Ok(());
                }

                () = self.reconnect_notify.notified() => {
                    // A stale permit from an earlier connection carries no reason
                    let Some(reason) = self.reconnect_reason.lock().take() else {
                        continue;
                    };
                    warn!(%reason, "Reconnect requested");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(?e, "Failed to send Close frame before reconnect");
                    }
                    break Err(WsError::ReconnectRequested(reason));
                }

                () = sleep_until_deadline(pong_deadline), if pong_deadline.is_some() => {
                    error!(timeout_ms = self.config.heartbeat_timeout_ms, "Heartbeat timeout");
                    break Err(WsError::HeartbeatTimeout);
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text_message(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!("Received ping, sending pong");
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.heartbeat.record_pong();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason): (u16, String) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "WebSocket closed by server");
                            break Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(?e, "WebSocket read error");
                            break Err(e.into());
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            break Err(WsError::ConnectionClosed {
                                code: 1006,
                                reason: "Stream ended".to_string(),
                            });
                        }
                    }
                }

                Some(text) = outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        break Err(e.into());
                    }
                }

                _ = ping_timer.tick() => {
                    if self.heartbeat.is_waiting_for_pong() {
                        continue;
                    }
                    let ping = match WsRequest::ping().to_text() {
                        Ok(ping) => ping,
                        Err(e) => break Err(e),
                    };
                    if let Err(e) = write.send(Message::Text(ping)).await {
                        break Err(e.into());
                    }
                    self.heartbeat.record_ping();
                    debug!("Sent heartbeat ping");
                }
            }
        };

        (Some(connected_at.elapsed()), result)
    }

    fn handle_text_message(&self, text: &str) {
        self.heartbeat.record_message();

        if text.contains("pong") && WsMessage::parse(text).is_ok_and(|m| m.is_pong()) {
            self.heartbeat.record_pong();
            return;
        }

        let handlers = self.message_handlers.read().clone();
        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(text))).is_err() {
                error!("Message observer panicked");
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev == next {
            return;
        }
        debug!(from = %prev, to = %next, "Transport state changed");

        Metrics::ws_state_set(next.as_str());
        if next == ConnectionState::Connected {
            Metrics::ws_connected();
        } else {
            Metrics::ws_disconnected();
        }

        let handlers = self.state_handlers.read().clone();
        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(next))).is_err() {
                error!(state = %next, "State observer panicked");
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn classify_connect_error(e: tungstenite::Error) -> WsError {
    match e {
        tungstenite::Error::Url(e) => WsError::InvalidUrl(e.to_string()),
        tungstenite::Error::HttpFormat(e) => WsError::InvalidUrl(e.to_string()),
        other => WsError::ConnectionFailed(other.to_string()),
    }
}

/// Exponential backoff without jitter: `base * 2^(attempt-1)`, capped at `max`.
///
/// attempt=1 -> base, attempt=2 -> 2*base, attempt=3 -> 4*base.
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    Duration::from_millis(delay)
}

/// Random jitter in `[0, max_ms]`.
fn rand_jitter(max_ms: u64) -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    if max_ms == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    u64::from(nanos) % (max_ms + 1)
}
