//! Authenticated session on top of a [`Transport`].
//!
//! Sends a freshly signed handshake every time the transport reaches
//! `Connected`, tracks the outcome, and gates private sends until the
//! exchange has accepted it.

use crate::connection::{ConnectionState, Transport};
use crate::error::{WsError, WsResult};
use crate::message::{WsMessage, WsRequest};
use bytrade_core::{AuthHandshake, Clock, Signer, SystemClock};
use bytrade_telemetry::Metrics;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Handshake expiry is `now + auth_expiry_window_ms`.
    pub auth_expiry_window_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_expiry_window_ms: 60_000,
        }
    }
}

/// Handshake progress for the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    /// No connection, or connection not yet handshaking.
    Idle,
    Pending,
    Authenticated,
    Failed(String),
}

/// Outcome of the latest handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthResult {
    pub authenticated: bool,
    pub error: Option<String>,
}

/// Called on the connection task after each successful handshake.
pub type AuthHandler = Arc<dyn Fn() + Send + Sync>;

pub struct Session {
    transport: Arc<Transport>,
    signer: Signer,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    auth_tx: watch::Sender<AuthStatus>,
    last_handshake: Mutex<Option<AuthHandshake>>,
    pending_req_id: Mutex<Option<String>>,
    auth_handlers: RwLock<Vec<AuthHandler>>,
    req_seq: AtomicU64,
}

impl Session {
    pub fn new(transport: Arc<Transport>, signer: Signer, config: SessionConfig) -> Arc<Self> {
        Self::with_clock(transport, signer, config, Arc::new(SystemClock))
    }

    /// Create a session and attach it to the transport's observers.
    pub fn with_clock(
        transport: Arc<Transport>,
        signer: Signer,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (auth_tx, _) = watch::channel(AuthStatus::Idle);
        let session = Arc::new(Self {
            transport: Arc::clone(&transport),
            signer,
            config,
            clock,
            auth_tx,
            last_handshake: Mutex::new(None),
            pending_req_id: Mutex::new(None),
            auth_handlers: RwLock::new(Vec::new()),
            req_seq: AtomicU64::new(0),
        });

        // Weak: the transport's observer lists must not keep the session alive
        let weak = Arc::downgrade(&session);
        transport.on_state_change(Arc::new(move |state: ConnectionState| {
            if let Some(session) = weak.upgrade() {
                session.on_transport_state(state);
            }
        }));
        let weak = Arc::downgrade(&session);
        transport.on_message(Arc::new(move |text: &str| {
            if let Some(session) = weak.upgrade() {
                session.on_transport_message(text);
            }
        }));

        session
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Connect the underlying transport.
    pub async fn connect(&self) -> WsResult<()> {
        self.transport.connect().await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    /// Transport state, with `Connected` refined by handshake progress.
    pub fn state(&self) -> ConnectionState {
        match self.transport.state() {
            ConnectionState::Connected => match *self.auth_tx.borrow() {
                AuthStatus::Authenticated => ConnectionState::Authenticated,
                _ => ConnectionState::Authenticating,
            },
            other => other,
        }
    }

    pub fn auth_status(&self) -> AuthStatus {
        self.auth_tx.borrow().clone()
    }

    pub fn auth_result(&self) -> AuthResult {
        match &*self.auth_tx.borrow() {
            AuthStatus::Authenticated => AuthResult {
                authenticated: true,
                error: None,
            },
            AuthStatus::Failed(reason) => AuthResult {
                authenticated: false,
                error: Some(reason.clone()),
            },
            AuthStatus::Idle | AuthStatus::Pending => AuthResult::default(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        *self.auth_tx.borrow() == AuthStatus::Authenticated && self.transport.is_connected()
    }

    /// The handshake sent on the current or most recent connection.
    pub fn last_handshake(&self) -> Option<AuthHandshake> {
        self.last_handshake.lock().clone()
    }

    pub fn on_authenticated(&self, handler: AuthHandler) {
        self.auth_handlers.write().push(handler);
    }

    /// Wait until the exchange accepts a handshake.
    ///
    /// Fails with `AuthFailed` on an explicit rejection and with `Closed`
    /// once the transport has stopped.
    pub async fn await_authenticated(&self) -> WsResult<()> {
        let mut auth_rx = self.auth_tx.subscribe();
        loop {
            match &*auth_rx.borrow_and_update() {
                AuthStatus::Authenticated => return Ok(()),
                AuthStatus::Failed(reason) => return Err(WsError::AuthFailed(reason.clone())),
                AuthStatus::Idle | AuthStatus::Pending => {}
            }
            if self.transport.is_stopped() {
                return Err(WsError::Closed);
            }
            tokio::select! {
                changed = auth_rx.changed() => {
                    if changed.is_err() {
                        return Err(WsError::Closed);
                    }
                }
                () = self.transport.stopped() => {}
            }
        }
    }

    /// Send a private frame. Requires an accepted handshake.
    pub fn send(&self, text: String) -> WsResult<()> {
        if !self.is_authenticated() {
            return Err(WsError::NotAuthenticated);
        }
        self.transport.send(text)
    }

    pub fn send_request(&self, request: &WsRequest) -> WsResult<()> {
        self.send(request.to_text()?)
    }

    fn next_req_id(&self) -> String {
        format!("auth-{}", self.req_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn on_transport_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => self.start_handshake(),
            _ => {
                // A failure stays visible until the next handshake starts
                self.auth_tx.send_if_modified(|status| match status {
                    AuthStatus::Authenticated => {
                        info!(%state, "Connection lost, session no longer authenticated");
                        *status = AuthStatus::Idle;
                        true
                    }
                    AuthStatus::Pending => {
                        *status = AuthStatus::Idle;
                        true
                    }
                    AuthStatus::Idle | AuthStatus::Failed(_) => false,
                });
            }
        }
    }

    fn start_handshake(&self) {
        let expires_at_ms = self.clock.now_ms() + self.config.auth_expiry_window_ms;
        let handshake = match self.signer.auth_handshake(expires_at_ms) {
            Ok(handshake) => handshake,
            Err(e) => {
                error!(error = %e, "Failed to sign auth handshake");
                self.auth_tx.send_replace(AuthStatus::Failed(e.to_string()));
                return;
            }
        };

        let req_id = self.next_req_id();
        let text = match WsRequest::auth(req_id.clone(), &handshake).to_text() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to encode auth handshake");
                self.auth_tx.send_replace(AuthStatus::Failed(e.to_string()));
                return;
            }
        };

        *self.pending_req_id.lock() = Some(req_id.clone());
        *self.last_handshake.lock() = Some(handshake);
        self.auth_tx.send_replace(AuthStatus::Pending);
        Metrics::ws_state_set(ConnectionState::Authenticating.as_str());

        info!(%req_id, expires_at_ms, "Sending auth handshake");
        if let Err(e) = self.transport.send(text) {
            warn!(error = %e, "Failed to queue auth handshake");
        }
    }

    fn on_transport_message(&self, text: &str) {
        let Ok(WsMessage::Op(op)) = WsMessage::parse(text) else {
            return;
        };
        if !op.is_auth() {
            return;
        }

        let expected = self.pending_req_id.lock().clone();
        if let (Some(expected), Some(got)) = (expected.as_deref(), op.req_id.as_deref()) {
            if expected != got {
                debug!(expected, got, "Ignoring auth response for an earlier handshake");
                return;
            }
        }

        if op.is_success() {
            self.auth_tx.send_replace(AuthStatus::Authenticated);
            Metrics::ws_auth(true);
            Metrics::ws_state_set(ConnectionState::Authenticated.as_str());
            info!(conn_id = ?op.conn_id, "Session authenticated");

            let handlers = self.auth_handlers.read().clone();
            for handler in &handlers {
                if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                    error!("Authenticated observer panicked");
                }
            }
        } else {
            let reason = op
                .ret_msg
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "auth rejected".to_string());
            error!(%reason, "Auth handshake rejected");
            Metrics::ws_auth(false);
            self.auth_tx.send_replace(AuthStatus::Failed(reason));
            self.transport.request_reconnect("auth_failed");
        }
    }
}
