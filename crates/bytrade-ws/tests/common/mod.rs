//! Mock exchange stream server for integration tests.
//!
//! Accepts WebSocket connections and answers like the private stream:
//! - `auth` (optionally rejecting the next N handshakes)
//! - `subscribe` / `unsubscribe` (optionally refusing listed topics)
//! - `ping` (can be silenced to provoke heartbeat timeouts)
//!
//! Every inbound frame is recorded with the index of its connection.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

/// A frame received by the server.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 1-based connection index.
    pub connection: u32,
    pub json: Value,
}

impl Frame {
    pub fn op(&self) -> &str {
        self.json.get("op").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn args(&self) -> Vec<Value> {
        self.json
            .get("args")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }

    pub fn topic_args(&self) -> Vec<String> {
        self.args()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

struct ServerState {
    frames: Mutex<Vec<Frame>>,
    connections: AtomicU32,
    auth_failures_left: AtomicU32,
    refused_topics: Mutex<HashSet<String>>,
    answer_pings: AtomicBool,
    kill_tx: broadcast::Sender<()>,
    push_tx: broadcast::Sender<String>,
}

pub struct MockExchange {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<ServerState>,
}

impl MockExchange {
    /// Start a new mock server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kill_tx, _) = broadcast::channel(16);
        let (push_tx, _) = broadcast::channel(64);
        let state = Arc::new(ServerState {
            frames: Mutex::new(Vec::new()),
            connections: AtomicU32::new(0),
            auth_failures_left: AtomicU32::new(0),
            refused_topics: Mutex::new(HashSet::new()),
            answer_pings: AtomicBool::new(true),
            kill_tx,
            push_tx,
        });
        let shutdown = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
                    }
                    () = accept_shutdown.cancelled() => break,
                }
            }
        });

        Self {
            addr,
            shutdown,
            state,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.state.frames.lock().clone()
    }

    pub fn frames_on(&self, connection: u32) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|f| f.connection == connection)
            .collect()
    }

    /// Frames with `op` on `connection`, ignoring heartbeats.
    pub fn ops_on(&self, connection: u32, op: &str) -> Vec<Frame> {
        self.frames_on(connection)
            .into_iter()
            .filter(|f| f.op() == op)
            .collect()
    }

    pub fn fail_next_auths(&self, n: u32) {
        self.state.auth_failures_left.store(n, Ordering::SeqCst);
    }

    pub fn refuse_topic(&self, topic: &str) {
        self.state.refused_topics.lock().insert(topic.to_string());
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Drop every open connection without a close frame.
    pub fn drop_connections(&self) {
        let _ = self.state.kill_tx.send(());
    }

    /// Push a frame to every open connection.
    pub fn push(&self, frame: Value) {
        let _ = self.state.push_tx.send(frame.to_string());
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.drop_connections();
    }
}

impl Drop for MockExchange {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let mut kill_rx = state.kill_tx.subscribe();
    let mut push_rx = state.push_tx.subscribe();

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {e}");
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = kill_rx.recv() => break,
            Ok(text) = push_rx.recv() => {
                let _ = write.send(Message::Text(text)).await;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = respond(&state, connection, &text) {
                            let _ = write.send(Message::Text(reply.to_string())).await;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn respond(state: &ServerState, connection: u32, text: &str) -> Option<Value> {
    let json: Value = serde_json::from_str(text).ok()?;
    let frame = Frame {
        connection,
        json: json.clone(),
    };
    state.frames.lock().push(frame.clone());

    let req_id = json.get("req_id").cloned().unwrap_or(Value::Null);
    match frame.op() {
        "auth" => {
            let fail = state
                .auth_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Some(json!({
                "success": !fail,
                "ret_msg": if fail { "Invalid sign" } else { "" },
                "op": "auth",
                "conn_id": format!("mock-{connection}"),
                "req_id": req_id,
            }))
        }
        "subscribe" => {
            let refused_set = state.refused_topics.lock().clone();
            let refused: Vec<String> = frame
                .topic_args()
                .into_iter()
                .filter(|t| refused_set.contains(t))
                .collect();
            let ret_msg = if refused.is_empty() {
                String::new()
            } else {
                format!("error:handler not found,topic:{}", refused.join(","))
            };
            Some(json!({
                "success": refused.is_empty(),
                "ret_msg": ret_msg,
                "op": "subscribe",
                "conn_id": format!("mock-{connection}"),
                "req_id": req_id,
            }))
        }
        "unsubscribe" => Some(json!({
            "success": true,
            "ret_msg": "",
            "op": "unsubscribe",
            "conn_id": format!("mock-{connection}"),
            "req_id": req_id,
        })),
        "ping" if state.answer_pings.load(Ordering::SeqCst) => Some(json!({
            "req_id": "",
            "op": "pong",
            "args": ["1675418560633"],
            "conn_id": format!("mock-{connection}"),
        })),
        _ => None,
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Await `fut` with a generous test timeout.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
