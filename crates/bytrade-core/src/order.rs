//! Order types, identifiers and the order lifecycle state machine.

use crate::decimal::{Price, Size};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Wire representation used by the exchange (`"Buy"` / `"Sell"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "Market",
            Self::Limit => "Limit",
        }
    }

    /// Time-in-force sent with this order type.
    ///
    /// Market orders must be IOC; limit orders rest on the book.
    pub fn time_in_force(&self) -> TimeInForce {
        match self {
            Self::Market => TimeInForce::ImmediateOrCancel,
            Self::Limit => TimeInForce::GoodTilCancelled,
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-in-force for orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    GoodTilCancelled,
    #[serde(rename = "IOC")]
    ImmediateOrCancel,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoodTilCancelled => "GTC",
            Self::ImmediateOrCancel => "IOC",
        }
    }
}

/// Client order ID, the sole correlation key between a REST submission
/// and the stream events reported for it.
///
/// Every order gets a fresh id that never changes. The exchange echoes it
/// back as `orderLinkId`, which is limited to 36 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Create a new unique client order ID.
    ///
    /// Format: `bt-{uuid_simple}` (35 characters).
    pub fn new() -> Self {
        Self(format!("bt-{}", Uuid::new_v4().simple()))
    }

    /// Wrap an id echoed back by the exchange.
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<&str> for ClientOrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ClientOrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of a tracked order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Created locally, REST request not yet answered.
    #[default]
    Pending,
    /// REST submission accepted.
    Submitted,
    /// Confirmed open by the stream.
    Acknowledged,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Position in the lifecycle. Terminal states share the highest rank.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Submitted => 1,
            Self::Acknowledged => 2,
            Self::PartiallyFilled => 3,
            Self::Filled | Self::Cancelled | Self::Rejected => 4,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    ///
    /// Terminal states are final. Repeated `PartiallyFilled` is allowed so
    /// fill progress can be recorded.
    #[must_use]
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
            || (*self == Self::PartiallyFilled && next == Self::PartiallyFilled)
    }

    /// Map an exchange `orderStatus` string.
    pub fn from_exchange(status: &str) -> Result<Self> {
        match status {
            "Created" | "New" | "Untriggered" | "Triggered" => Ok(Self::Acknowledged),
            "PartiallyFilled" => Ok(Self::PartiallyFilled),
            "Filled" => Ok(Self::Filled),
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => Ok(Self::Cancelled),
            "Rejected" => Ok(Self::Rejected),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Acknowledged => "acknowledged",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied description of an order to place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Size,
    /// Required for, and only for, limit orders.
    pub price: Option<Price>,
}

impl OrderSpec {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Size) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: Size, price: Price) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
        }
    }

    /// Local validation performed before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(CoreError::InvalidSymbol(self.symbol.clone()));
        }
        if !self.quantity.is_positive() {
            return Err(CoreError::InvalidSize(format!(
                "quantity must be > 0, got {}",
                self.quantity
            )));
        }
        match (self.order_type, self.price) {
            (OrderType::Limit, None) => Err(CoreError::InvalidPrice(
                "limit order requires a price".to_string(),
            )),
            (OrderType::Limit, Some(p)) if !p.is_positive() => Err(CoreError::InvalidPrice(
                format!("limit price must be > 0, got {p}"),
            )),
            (OrderType::Market, Some(_)) => Err(CoreError::InvalidPrice(
                "market order must not carry a price".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// An order tracked from creation to its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: ClientOrderId,
    /// Exchange-assigned id, known once the REST response or a stream event arrives.
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Size,
    pub price: Option<Price>,
    pub status: OrderStatus,
    /// Cumulative executed quantity.
    pub filled_quantity: Size,
    /// Exchange-reported reason for a rejection.
    pub reject_reason: Option<String>,
    /// Creation timestamp (Unix milliseconds).
    pub created_at: u64,
    /// Last update timestamp (Unix milliseconds).
    pub last_updated_at: u64,
    /// Sequence (exchange `updatedTime`) of the last applied stream event.
    pub last_event_seq: Option<u64>,
}

impl Order {
    /// Create an order record in `Pending`.
    #[must_use]
    pub fn new(client_order_id: ClientOrderId, spec: OrderSpec, now_ms: u64) -> Self {
        Self {
            client_order_id,
            exchange_order_id: None,
            symbol: spec.symbol,
            side: spec.side,
            order_type: spec.order_type,
            quantity: spec.quantity,
            price: spec.price,
            status: OrderStatus::Pending,
            filled_quantity: Size::ZERO,
            reject_reason: None,
            created_at: now_ms,
            last_updated_at: now_ms,
            last_event_seq: None,
        }
    }

    /// Apply a status transition.
    ///
    /// Returns `false` (and leaves the order untouched) when the transition
    /// would regress the lifecycle or the event is older than the last
    /// applied one.
    pub fn transition(&mut self, next: OrderStatus, event_seq: Option<u64>, now_ms: u64) -> bool {
        if let (Some(seq), Some(last)) = (event_seq, self.last_event_seq) {
            if seq < last {
                return false;
            }
        }
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.last_updated_at = now_ms;
        if event_seq.is_some() {
            self.last_event_seq = event_seq;
        }
        true
    }

    /// Record cumulative fill progress. Never decreases.
    pub fn record_fill(&mut self, cumulative: Size) -> Size {
        if cumulative <= self.filled_quantity {
            return Size::ZERO;
        }
        let fill = cumulative - self.filled_quantity;
        self.filled_quantity = cumulative;
        fill
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
