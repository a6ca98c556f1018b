//! Order placement and recurring orders for bytrade.
//!
//! # Key Components
//!
//! - [`RestClient`]: signed account and order REST calls
//!   ([`BybitRestClient`] for the exchange, [`MockRestClient`] for tests)
//! - [`OrderGateway`]: submits orders and tracks each one from `Pending` to a
//!   terminal state, merging REST responses with `order` stream events
//! - [`ScheduledOrderRunner`]: drift-free recurring actions with cancellation
//!
//! # Failure Taxonomy
//!
//! - Transient REST failures (network, 5xx, rate limit) are retried once
//!   after a backoff, reusing the same `orderLinkId`
//! - Exchange rejections (`retCode != 0`) are terminal and never retried

pub mod error;
pub mod gateway;
pub mod rest;
pub mod scheduler;

pub use error::{
    ExecutorError, ExecutorResult, GatewayError, GatewayResult, RestError, RestResult,
    RET_CODE_DUPLICATE_LINK_ID,
};
pub use gateway::{GatewayConfig, OrderEvent, OrderEventHandler, OrderGateway};
pub use rest::{
    decode_response, ApiKeyInfo, BoxFuture, BybitRestClient, CancelOrderRequest, Category,
    CoinBalance, MockRestClient, OpenOrder, OrderAck, PlaceOrderRequest, RestClient, RestConfig,
    WalletBalance, MAINNET_REST_URL, TESTNET_REST_URL,
};
pub use scheduler::{JobHandle, ScheduledOrderRunner};
