//! Subscription management for stream topics.
//!
//! Holds the desired topic set independently of any connection. After every
//! accepted handshake the full set is sent again in one request, so a
//! reconnect restores exactly what the caller asked for. Inbound topic pushes
//! are routed to handlers registered by exact topic or topic prefix.

use crate::connection::ConnectionState;
use crate::error::WsError;
use crate::message::{OpMessage, TopicMessage, WsMessage, WsRequest};
use crate::session::Session;
use bytrade_core::Topic;
use bytrade_telemetry::Metrics;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Handler for pushes on a topic.
pub type TopicHandler = Arc<dyn Fn(&TopicMessage) + Send + Sync>;

/// How a handler selects topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicMatcher {
    Exact(String),
    Prefix(String),
}

impl TopicMatcher {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(t) => topic == t,
            Self::Prefix(p) => topic.starts_with(p.as_str()),
        }
    }
}

/// Snapshot of subscription state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionHealth {
    pub desired: Vec<Topic>,
    /// Desired topics the exchange refused on the current connection.
    pub rejected: Vec<Topic>,
    pub unmatched_messages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    op: SubscriptionOp,
    topics: Vec<Topic>,
}

pub struct SubscriptionManager {
    session: Arc<Session>,
    // Lock order: desired, then rejected.
    desired: RwLock<BTreeSet<Topic>>,
    /// Whether the full set went out on the current connection. Written
    /// only while holding the `desired` write lock.
    restored: AtomicBool,
    rejected: RwLock<BTreeSet<Topic>>,
    handlers: RwLock<Vec<(TopicMatcher, TopicHandler)>>,
    /// In-flight requests by `req_id`.
    pending: Mutex<HashMap<String, PendingRequest>>,
    unmatched: AtomicU64,
    req_seq: AtomicU64,
}

impl SubscriptionManager {
    /// Create a manager bound to `session` and start observing its stream.
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        let manager = Arc::new(Self {
            session: Arc::clone(&session),
            desired: RwLock::new(BTreeSet::new()),
            restored: AtomicBool::new(false),
            rejected: RwLock::new(BTreeSet::new()),
            handlers: RwLock::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            unmatched: AtomicU64::new(0),
            req_seq: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&manager);
        session.on_authenticated(Arc::new(move || {
            if let Some(manager) = weak.upgrade() {
                manager.resubscribe_all();
            }
        }));
        let weak = Arc::downgrade(&manager);
        session
            .transport()
            .on_state_change(Arc::new(move |state: ConnectionState| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_transport_state(state);
                }
            }));
        let weak = Arc::downgrade(&manager);
        session.transport().on_message(Arc::new(move |text: &str| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_message(text);
            }
        }));

        manager
    }

    /// Add topics to the desired set.
    ///
    /// Only topics not already desired are sent, and only once the full set
    /// has been restored on the current connection. Otherwise they go out
    /// with the next re-subscribe.
    pub fn subscribe<I>(&self, topics: I)
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut desired = self.desired.write();
        let added: Vec<Topic> = topics
            .into_iter()
            .filter(|t| desired.insert(t.clone()))
            .collect();
        if added.is_empty() {
            return;
        }

        if self.is_live() {
            self.send_op(SubscriptionOp::Subscribe, added);
        } else {
            debug!(
                count = added.len(),
                "Subscriptions not restored yet, topics will be sent with the next re-subscribe"
            );
        }
    }

    /// Remove topics from the desired set.
    pub fn unsubscribe<I>(&self, topics: I)
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut desired = self.desired.write();
        let removed: Vec<Topic> = topics.into_iter().filter(|t| desired.remove(t)).collect();
        if removed.is_empty() {
            return;
        }

        {
            let mut rejected = self.rejected.write();
            for topic in &removed {
                rejected.remove(topic);
            }
            Metrics::subscription_rejected_set(rejected.len());
        }

        if self.is_live() {
            self.send_op(SubscriptionOp::Unsubscribe, removed);
        }
    }

    pub fn on_topic(&self, topic: Topic, handler: TopicHandler) {
        self.handlers
            .write()
            .push((TopicMatcher::Exact(topic.as_str().to_string()), handler));
    }

    pub fn on_topic_prefix(&self, prefix: impl Into<String>, handler: TopicHandler) {
        self.handlers
            .write()
            .push((TopicMatcher::Prefix(prefix.into()), handler));
    }

    pub fn desired_topics(&self) -> Vec<Topic> {
        self.desired.read().iter().cloned().collect()
    }

    pub fn rejected_topics(&self) -> Vec<Topic> {
        self.rejected.read().iter().cloned().collect()
    }

    /// Topic pushes that matched no handler.
    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> SubscriptionHealth {
        SubscriptionHealth {
            desired: self.desired_topics(),
            rejected: self.rejected_topics(),
            unmatched_messages: self.unmatched_count(),
        }
    }

    /// Caller must hold the `desired` lock.
    fn is_live(&self) -> bool {
        self.restored.load(Ordering::SeqCst) && self.session.is_authenticated()
    }

    fn on_transport_state(&self, state: ConnectionState) {
        let _desired = self.desired.write();
        if self.restored.swap(false, Ordering::SeqCst) {
            debug!(%state, "Connection changed, subscriptions must be restored");
        }
    }

    /// Send the full desired set in one request. Runs after each handshake.
    ///
    /// Holds the `desired` write lock across the send, so a concurrent
    /// `subscribe` either lands in this request or goes out after it.
    fn resubscribe_all(&self) {
        let desired = self.desired.write();
        self.restored.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        {
            let mut rejected = self.rejected.write();
            rejected.clear();
            Metrics::subscription_rejected_set(0);
        }

        if desired.is_empty() {
            debug!("No topics to restore");
            return;
        }

        let topics: Vec<Topic> = desired.iter().cloned().collect();
        info!(count = topics.len(), "Restoring subscriptions");
        self.send_op(SubscriptionOp::Subscribe, topics);
    }

    fn send_op(&self, op: SubscriptionOp, topics: Vec<Topic>) {
        let req_id = format!("sub-{}", self.req_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let request = match op {
            SubscriptionOp::Subscribe => WsRequest::subscribe(req_id.clone(), &topics),
            SubscriptionOp::Unsubscribe => WsRequest::unsubscribe(req_id.clone(), &topics),
        };
        let count = topics.len();

        // Registered before sending: the ack may arrive on the connection task first
        self.pending
            .lock()
            .insert(req_id.clone(), PendingRequest { op, topics });

        match self.session.send_request(&request) {
            Ok(()) => debug!(%req_id, op = op.as_str(), count, "Subscription request sent"),
            Err(e) => {
                self.pending.lock().remove(&req_id);
                log_send_failure(op, &e);
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let msg = match WsMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "Ignoring unparseable frame");
                return;
            }
        };

        match msg {
            WsMessage::Op(op) if op.is_subscription_ack() => self.handle_ack(op),
            WsMessage::Op(_) => {}
            WsMessage::Topic(topic_msg) => self.route(&topic_msg),
        }
    }

    fn handle_ack(&self, op: OpMessage) {
        let Some(req_id) = op.req_id.as_deref() else {
            debug!(op = %op.op, "Subscription ack without req_id");
            return;
        };
        let Some(request) = self.pending.lock().remove(req_id) else {
            debug!(req_id, "Ack for unknown subscription request");
            return;
        };

        if op.is_success() {
            if request.op == SubscriptionOp::Subscribe {
                let mut rejected = self.rejected.write();
                for topic in &request.topics {
                    rejected.remove(topic);
                }
                Metrics::subscription_rejected_set(rejected.len());
            }
            info!(req_id, op = request.op.as_str(), count = request.topics.len(), "Subscription acknowledged");
            return;
        }

        let ret_msg = op.ret_msg.unwrap_or_default();
        if request.op == SubscriptionOp::Unsubscribe {
            warn!(req_id, %ret_msg, "Unsubscribe rejected by exchange");
            return;
        }

        let named = topics_named_in(&ret_msg, &request.topics);
        let refused = if named.is_empty() { request.topics } else { named };

        let desired = self.desired.read();
        let mut rejected = self.rejected.write();
        for topic in refused {
            if desired.contains(&topic) {
                rejected.insert(topic);
            }
        }
        Metrics::subscription_rejected_set(rejected.len());
        warn!(req_id, %ret_msg, rejected = ?*rejected, "Subscription rejected by exchange");
    }

    fn route(&self, msg: &TopicMessage) {
        let handlers: Vec<TopicHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|(matcher, _)| matcher.matches(&msg.topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            let unmatched = self.unmatched.fetch_add(1, Ordering::Relaxed) + 1;
            Metrics::ws_unmatched_message();
            debug!(topic = %msg.topic, unmatched, "No handler for topic, dropping");
            return;
        }

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                error!(topic = %msg.topic, "Topic handler panicked");
            }
        }
    }
}

fn log_send_failure(op: SubscriptionOp, e: &WsError) {
    match op {
        SubscriptionOp::Subscribe => warn!(
            error = %e,
            "Failed to send subscribe, topics will be sent after the next handshake"
        ),
        SubscriptionOp::Unsubscribe => warn!(error = %e, "Failed to send unsubscribe"),
    }
}

/// Topics from `topics` that appear as whole tokens in `ret_msg`.
///
/// `error:handler not found,topic:orderbook.1.FOOUSDT` names `orderbook.1.FOOUSDT`.
fn topics_named_in(ret_msg: &str, topics: &[Topic]) -> Vec<Topic> {
    let tokens: BTreeSet<&str> = ret_msg
        .split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        .filter(|t| !t.is_empty())
        .collect();
    topics
        .iter()
        .filter(|t| tokens.contains(t.as_str()))
        .cloned()
        .collect()
}
