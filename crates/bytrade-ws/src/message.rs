//! WebSocket message types.
//!
//! Outbound frames are `{req_id, op, args}` requests. Inbound frames are
//! either op responses (`auth`, `subscribe`, `pong`, ...) or topic pushes.

use crate::error::WsResult;
use bytrade_core::{AuthHandshake, Size, Topic};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Requests (Outgoing)
// ============================================================================

/// Outbound operation request.
#[derive(Debug, Clone, Serialize)]
pub struct WsRequest {
    /// Echoed back in the response so acks can be correlated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    pub op: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
}

impl WsRequest {
    /// `{"op":"auth","args":[api_key, expires, signature]}`.
    pub fn auth(req_id: impl Into<String>, handshake: &AuthHandshake) -> Self {
        Self {
            req_id: Some(req_id.into()),
            op: "auth".to_string(),
            args: vec![
                serde_json::Value::from(handshake.api_key.clone()),
                serde_json::Value::from(handshake.expires_at_ms),
                serde_json::Value::from(handshake.signature.clone()),
            ],
        }
    }

    pub fn subscribe(req_id: impl Into<String>, topics: &[Topic]) -> Self {
        Self::topics_op("subscribe", req_id.into(), topics)
    }

    pub fn unsubscribe(req_id: impl Into<String>, topics: &[Topic]) -> Self {
        Self::topics_op("unsubscribe", req_id.into(), topics)
    }

    /// Application-level heartbeat.
    pub fn ping() -> Self {
        Self {
            req_id: None,
            op: "ping".to_string(),
            args: Vec::new(),
        }
    }

    pub fn to_text(&self) -> WsResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn topics_op(op: &str, req_id: String, topics: &[Topic]) -> Self {
        Self {
            req_id: Some(req_id),
            op: op.to_string(),
            args: topics
                .iter()
                .map(|t| serde_json::Value::from(t.as_str()))
                .collect(),
        }
    }
}

// ============================================================================
// Op responses (Incoming)
// ============================================================================

/// Response to an outbound op.
///
/// ```json
/// {"success":true,"ret_msg":"","op":"auth","conn_id":"cejreaspqfh3sjdnldmg-p","req_id":"auth-1"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpMessage {
    pub op: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub ret_msg: Option<String>,
    #[serde(default)]
    pub req_id: Option<String>,
    #[serde(default)]
    pub conn_id: Option<String>,
}

impl OpMessage {
    /// Both heartbeat reply shapes:
    /// `{"op":"pong",...}` (private streams) and
    /// `{"op":"ping","ret_msg":"pong","success":true}` (public streams).
    pub fn is_pong(&self) -> bool {
        self.op == "pong" || (self.op == "ping" && self.ret_msg.as_deref() == Some("pong"))
    }

    pub fn is_auth(&self) -> bool {
        self.op == "auth"
    }

    pub fn is_subscription_ack(&self) -> bool {
        self.op == "subscribe" || self.op == "unsubscribe"
    }

    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(false)
    }
}

// ============================================================================
// Topic pushes (Incoming)
// ============================================================================

/// Data pushed on a subscribed topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
    /// `snapshot` or `delta` on public streams; absent on private ones.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    /// Server timestamp (public streams).
    #[serde(default)]
    pub ts: Option<u64>,
    /// Server timestamp (private streams).
    #[serde(rename = "creationTime", default)]
    pub creation_time: Option<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TopicMessage {
    pub fn is_order_topic(&self) -> bool {
        self.topic == ORDER_TOPIC || self.topic.starts_with("order.")
    }

    /// Parse the entries of an `order` push.
    ///
    /// Elements that fail to parse are counted and skipped.
    pub fn order_updates(&self) -> OrderUpdatesResult {
        if !self.is_order_topic() {
            return OrderUpdatesResult::default();
        }
        match &self.data {
            serde_json::Value::Array(arr) => {
                let mut updates = Vec::with_capacity(arr.len());
                let mut failed_count = 0;

                for v in arr {
                    match serde_json::from_value::<OrderUpdate>(v.clone()) {
                        Ok(update) => updates.push(update),
                        Err(e) => {
                            tracing::debug!(
                                error = %e,
                                element = ?v,
                                "Failed to parse order update element"
                            );
                            failed_count += 1;
                        }
                    }
                }

                OrderUpdatesResult {
                    updates,
                    failed_count,
                }
            }
            serde_json::Value::Object(_) => {
                match serde_json::from_value::<OrderUpdate>(self.data.clone()) {
                    Ok(update) => OrderUpdatesResult {
                        updates: vec![update],
                        failed_count: 0,
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "Failed to parse order update object");
                        OrderUpdatesResult {
                            updates: Vec::new(),
                            failed_count: 1,
                        }
                    }
                }
            }
            _ => OrderUpdatesResult::default(),
        }
    }
}

/// Private order stream topic.
pub const ORDER_TOPIC: &str = "order";

/// One entry of the private `order` topic.
///
/// Numeric fields arrive as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    /// Exchange order ID.
    pub order_id: String,
    /// Our client order ID, echoed back.
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    pub order_status: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub cum_exec_qty: Option<String>,
    #[serde(default)]
    pub avg_price: Option<String>,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub updated_time: Option<String>,
}

impl OrderUpdate {
    /// Exchange update time, used to order events for the same order.
    pub fn updated_time_ms(&self) -> Option<u64> {
        self.updated_time.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn cum_exec_qty(&self) -> Option<Size> {
        self.cum_exec_qty
            .as_deref()
            .and_then(|s| Size::from_str(s).ok())
    }

    /// Reject reason, ignoring the exchange's `EC_NoError` placeholder.
    pub fn reject_reason(&self) -> Option<&str> {
        self.reject_reason
            .as_deref()
            .filter(|r| !r.is_empty() && *r != "EC_NoError")
    }
}

/// Result of parsing order updates.
#[derive(Debug, Clone, Default)]
pub struct OrderUpdatesResult {
    /// Successfully parsed order updates.
    pub updates: Vec<OrderUpdate>,
    /// Number of elements that failed to parse.
    pub failed_count: usize,
}

// ============================================================================
// Core WebSocket Messages
// ============================================================================

/// Incoming WebSocket message.
///
/// Topic pushes carry a `topic` field; everything else is an op response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WsMessage {
    Topic(TopicMessage),
    Op(OpMessage),
}

impl WsMessage {
    pub fn parse(text: &str) -> WsResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_pong(&self) -> bool {
        matches!(self, Self::Op(op) if op.is_pong())
    }

    pub fn as_op(&self) -> Option<&OpMessage> {
        match self {
            Self::Op(op) => Some(op),
            Self::Topic(_) => None,
        }
    }

    pub fn as_topic(&self) -> Option<&TopicMessage> {
        match self {
            Self::Topic(t) => Some(t),
            Self::Op(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    #[test]
    fn test_auth_request_serialization() {
        let handshake = AuthHandshake {
            api_key: "XXXX".to_string(),
            expires_at_ms: 1_662_350_400_000,
            signature: "abcd".to_string(),
        };
        let text = WsRequest::auth("auth-1", &handshake).to_text().unwrap();
        assert_eq!(
            text,
            r#"{"req_id":"auth-1","op":"auth","args":["XXXX",1662350400000,"abcd"]}"#
        );
    }

    #[test]
    fn test_subscribe_request_serialization() {
        let req = WsRequest::subscribe("sub-1", &[topic("order"), topic("execution")]);
        assert_eq!(
            req.to_text().unwrap(),
            r#"{"req_id":"sub-1","op":"subscribe","args":["order","execution"]}"#
        );
    }

    #[test]
    fn test_ping_has_no_args() {
        assert_eq!(WsRequest::ping().to_text().unwrap(), r#"{"op":"ping"}"#);
    }

    #[test]
    fn test_parse_auth_response() {
        let json = r#"{"success":true,"ret_msg":"","op":"auth","conn_id":"c1","req_id":"auth-1"}"#;
        let msg = WsMessage::parse(json).unwrap();
        let op = msg.as_op().unwrap();
        assert!(op.is_auth());
        assert!(op.is_success());
        assert_eq!(op.req_id.as_deref(), Some("auth-1"));
    }

    #[test]
    fn test_parse_both_pong_shapes() {
        let private = r#"{"req_id":"","op":"pong","args":["1675418560633"],"conn_id":"c1"}"#;
        let public = r#"{"success":true,"ret_msg":"pong","conn_id":"c2","op":"ping"}"#;
        assert!(WsMessage::parse(private).unwrap().is_pong());
        assert!(WsMessage::parse(public).unwrap().is_pong());

        let outbound_echo = r#"{"op":"ping"}"#;
        assert!(!WsMessage::parse(outbound_echo).unwrap().is_pong());
    }

    #[test]
    fn test_parse_topic_message() {
        let json = r#"{"topic":"orderbook.1.BTCUSDT","type":"snapshot","ts":1672304484978,"data":{"s":"BTCUSDT"}}"#;
        let msg = WsMessage::parse(json).unwrap();
        let t = msg.as_topic().unwrap();
        assert_eq!(t.topic, "orderbook.1.BTCUSDT");
        assert_eq!(t.kind.as_deref(), Some("snapshot"));
        assert_eq!(t.ts, Some(1_672_304_484_978));
        assert!(!msg.is_pong());
    }

    #[test]
    fn test_order_updates_parsing() {
        let json = r#"{
            "id": "5923240c6880ab-c59f-420b-9adb-3639adc9dd90",
            "topic": "order",
            "creationTime": 1672364262474,
            "data": [
                {
                    "symbol": "ETHUSDT",
                    "orderId": "5cf98598-39a7-459e-97bf-76ca765ee020",
                    "side": "Sell",
                    "orderType": "Market",
                    "orderLinkId": "bt-abc",
                    "orderStatus": "Filled",
                    "cumExecQty": "0.01",
                    "avgPrice": "1190.05",
                    "rejectReason": "EC_NoError",
                    "updatedTime": "1672364262457"
                },
                {"garbage": true}
            ]
        }"#;
        let msg = WsMessage::parse(json).unwrap();
        let result = msg.as_topic().unwrap().order_updates();

        assert_eq!(result.updates.len(), 1);
        assert_eq!(result.failed_count, 1);

        let update = &result.updates[0];
        assert_eq!(update.order_link_id, "bt-abc");
        assert_eq!(update.order_status, "Filled");
        assert_eq!(update.updated_time_ms(), Some(1_672_364_262_457));
        assert_eq!(update.cum_exec_qty().unwrap().to_string(), "0.01");
        assert_eq!(update.reject_reason(), None);
    }

    #[test]
    fn test_order_updates_ignores_other_topics() {
        let json = r#"{"topic":"execution","data":[{"orderId":"1","symbol":"X","orderStatus":"New"}]}"#;
        let msg = WsMessage::parse(json).unwrap();
        assert!(msg.as_topic().unwrap().order_updates().updates.is_empty());
    }
}
