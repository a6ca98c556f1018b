//! Signed REST client for the exchange's v5 API.
//!
//! [`RestClient`] is the seam the order gateway talks through.
//! [`BybitRestClient`] signs every call with the v5 header scheme;
//! [`MockRestClient`] records calls and replays scripted results for tests.

use crate::error::{ExecutorError, ExecutorResult, RestError, RestResult};
use bytrade_core::{
    ClientOrderId, Clock, HttpMethod, Order, OrderSide, OrderType, Price, Signer, Size,
    SystemClock, TimeInForce,
};
use bytrade_telemetry::Metrics;
use bytrade_ws::OrderUpdate;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const MAINNET_REST_URL: &str = "https://api.bybit.com";
pub const TESTNET_REST_URL: &str = "https://api-testnet.bybit.com";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECV_WINDOW_MS: u64 = 5_000;

const HEADER_API_KEY: &str = "X-BAPI-API-KEY";
const HEADER_TIMESTAMP: &str = "X-BAPI-TIMESTAMP";
const HEADER_SIGN: &str = "X-BAPI-SIGN";
const HEADER_RECV_WINDOW: &str = "X-BAPI-RECV-WINDOW";
const HEADER_SIGN_TYPE: &str = "X-BAPI-SIGN-TYPE";
/// HMAC-SHA256.
const SIGN_TYPE_HMAC: &str = "2";

const PATH_ORDER_CREATE: &str = "/v5/order/create";
const PATH_ORDER_CANCEL: &str = "/v5/order/cancel";
const PATH_ORDER_REALTIME: &str = "/v5/order/realtime";
const PATH_ORDER_HISTORY: &str = "/v5/order/history";
const PATH_WALLET_BALANCE: &str = "/v5/account/wallet-balance";
const PATH_API_KEY_INFO: &str = "/v5/user/query-api";

// ============================================================================
// Request / response types
// ============================================================================

/// Product category orders are placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Spot,
    Linear,
    Inverse,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Linear => "linear",
            Self::Inverse => "inverse",
        }
    }
}

/// `POST /v5/order/create` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceOrderRequest {
    pub category: Category,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Size,
    pub price: Option<Price>,
    pub time_in_force: TimeInForce,
    /// Sent as `orderLinkId`.
    pub client_order_id: ClientOrderId,
}

impl PlaceOrderRequest {
    pub fn from_order(order: &Order, category: Category) -> Self {
        Self {
            category,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
            time_in_force: order.order_type.time_in_force(),
            client_order_id: order.client_order_id.clone(),
        }
    }

    /// Wire parameters, keys sorted for signing.
    pub fn to_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("category".to_string(), self.category.as_str().to_string());
        params.insert("symbol".to_string(), self.symbol.clone());
        params.insert("side".to_string(), self.side.as_str().to_string());
        params.insert("orderType".to_string(), self.order_type.as_str().to_string());
        params.insert("qty".to_string(), self.quantity.to_string());
        params.insert(
            "timeInForce".to_string(),
            self.time_in_force.as_str().to_string(),
        );
        params.insert(
            "orderLinkId".to_string(),
            self.client_order_id.as_str().to_string(),
        );
        if let Some(price) = self.price {
            params.insert("price".to_string(), price.to_string());
        }
        // Spot market buys are otherwise sized in the quote coin
        if self.category == Category::Spot && self.order_type == OrderType::Market {
            params.insert("marketUnit".to_string(), "baseCoin".to_string());
        }
        params
    }
}

/// `POST /v5/order/cancel` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOrderRequest {
    pub category: Category,
    pub symbol: String,
    pub client_order_id: ClientOrderId,
}

impl CancelOrderRequest {
    pub fn to_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("category".to_string(), self.category.as_str().to_string());
        params.insert("symbol".to_string(), self.symbol.clone());
        params.insert(
            "orderLinkId".to_string(),
            self.client_order_id.as_str().to_string(),
        );
        params
    }
}

/// Result of order create / cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

/// An entry of `GET /v5/order/realtime` or `GET /v5/order/history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub qty: String,
    pub order_status: String,
    #[serde(default)]
    pub cum_exec_qty: String,
    #[serde(default)]
    pub created_time: String,
    #[serde(default)]
    pub updated_time: String,
}

impl OpenOrder {
    /// View this entry as a stream order update.
    pub fn to_update(&self) -> OrderUpdate {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        OrderUpdate {
            order_id: self.order_id.clone(),
            order_link_id: self.order_link_id.clone(),
            symbol: self.symbol.clone(),
            order_status: self.order_status.clone(),
            side: non_empty(&self.side),
            cum_exec_qty: non_empty(&self.cum_exec_qty),
            avg_price: None,
            reject_reason: None,
            updated_time: non_empty(&self.updated_time),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

/// One account of `GET /v5/account/wallet-balance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    pub account_type: String,
    #[serde(default)]
    pub total_equity: String,
    #[serde(default)]
    pub coin: Vec<CoinBalance>,
}

impl WalletBalance {
    pub fn coin(&self, name: &str) -> Option<&CoinBalance> {
        self.coin.iter().find(|c| c.coin == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinBalance {
    pub coin: String,
    #[serde(default)]
    pub wallet_balance: String,
    #[serde(default)]
    pub equity: String,
    #[serde(default)]
    pub locked: String,
}

/// `GET /v5/user/query-api`: the key's own metadata, including the account UID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub note: String,
    pub api_key: String,
    /// 0 = read-write, 1 = read-only.
    #[serde(default)]
    pub read_only: u8,
    #[serde(rename = "userID")]
    pub user_id: u64,
}

/// Every v5 response: `{retCode, retMsg, result}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

/// Decode a response body, applying the envelope and HTTP status rules.
///
/// 429 and 5xx are network failures. Any other status is decoded as an
/// envelope when possible so the exchange's own `retMsg` is kept.
pub fn decode_response<T: DeserializeOwned>(status: u16, body: &str) -> RestResult<T> {
    if status == StatusCode::TOO_MANY_REQUESTS.as_u16() || status >= 500 {
        return Err(RestError::Network(format!("HTTP {status}: {body}")));
    }

    let envelope: ApiResponse = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) if (200..300).contains(&status) => {
            return Err(RestError::Decode(format!("invalid envelope: {e}")));
        }
        Err(_) => {
            return Err(RestError::Exchange {
                code: i64::from(status),
                message: format!("HTTP {status}: {body}"),
            });
        }
    };

    if envelope.ret_code != 0 {
        return Err(RestError::Exchange {
            code: envelope.ret_code,
            message: envelope.ret_msg,
        });
    }

    serde_json::from_value(envelope.result)
        .map_err(|e| RestError::Decode(format!("unexpected result shape: {e}")))
}

// ============================================================================
// RestClient trait
// ============================================================================

/// Signed account and order operations.
pub trait RestClient: Send + Sync {
    fn place_order(&self, request: PlaceOrderRequest) -> BoxFuture<'_, RestResult<OrderAck>>;

    fn cancel_order(&self, request: CancelOrderRequest) -> BoxFuture<'_, RestResult<OrderAck>>;

    /// Orders currently open on the exchange.
    fn get_open_orders(
        &self,
        category: Category,
        symbol: Option<String>,
    ) -> BoxFuture<'_, RestResult<Vec<OpenOrder>>>;

    /// A single order by `orderLinkId`, open or closed.
    fn get_order(
        &self,
        category: Category,
        client_order_id: ClientOrderId,
    ) -> BoxFuture<'_, RestResult<Option<OpenOrder>>>;

    fn get_wallet_balance(&self, account_type: String)
        -> BoxFuture<'_, RestResult<Vec<WalletBalance>>>;

    fn get_api_key_info(&self) -> BoxFuture<'_, RestResult<ApiKeyInfo>>;
}

// ============================================================================
// BybitRestClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub recv_window_ms: u64,
    pub timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: MAINNET_REST_URL.to_string(),
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// REST client signing every call with the v5 header scheme.
pub struct BybitRestClient {
    client: Client,
    signer: Signer,
    config: RestConfig,
    clock: Arc<dyn Clock>,
}

impl BybitRestClient {
    pub fn new(config: RestConfig, signer: Signer) -> ExecutorResult<Self> {
        Self::with_clock(config, signer, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RestConfig,
        signer: Signer,
        clock: Arc<dyn Clock>,
    ) -> ExecutorResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExecutorError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            signer,
            config,
            clock,
        })
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: HttpMethod,
        path: &'static str,
        params: BTreeMap<String, String>,
    ) -> RestResult<T> {
        let result = self.send_signed(method, path, params).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome_label(),
        };
        Metrics::rest_request(path, outcome);
        result
    }

    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: HttpMethod,
        path: &str,
        params: BTreeMap<String, String>,
    ) -> RestResult<T> {
        let signed = self.signer.sign_request(
            method,
            path,
            params,
            self.clock.now_ms(),
            self.config.recv_window_ms,
        )?;

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let builder = match method {
            HttpMethod::Get => {
                let query = signed.query_string();
                let url = if query.is_empty() {
                    url
                } else {
                    format!("{url}?{query}")
                };
                self.client.get(url)
            }
            // The exact bytes that were signed
            HttpMethod::Post => self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(signed.body.clone().unwrap_or_default()),
        };

        debug!(method = method.as_str(), path, "Sending signed request");

        let response = builder
            .header(HEADER_API_KEY, self.signer.api_key())
            .header(HEADER_TIMESTAMP, signed.timestamp_ms.to_string())
            .header(HEADER_SIGN, &signed.signature)
            .header(HEADER_RECV_WINDOW, signed.recv_window_ms.to_string())
            .header(HEADER_SIGN_TYPE, SIGN_TYPE_HMAC)
            .send()
            .await
            .map_err(|e| RestError::Network(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RestError::Network(format!("Failed to read response: {e}")))?;
        trace!(path, status = status.as_u16(), body = %body, "Response received");

        decode_response(status.as_u16(), &body)
    }
}

impl RestClient for BybitRestClient {
    fn place_order(&self, request: PlaceOrderRequest) -> BoxFuture<'_, RestResult<OrderAck>> {
        Box::pin(async move {
            self.request(HttpMethod::Post, PATH_ORDER_CREATE, request.to_params())
                .await
        })
    }

    fn cancel_order(&self, request: CancelOrderRequest) -> BoxFuture<'_, RestResult<OrderAck>> {
        Box::pin(async move {
            self.request(HttpMethod::Post, PATH_ORDER_CANCEL, request.to_params())
                .await
        })
    }

    fn get_open_orders(
        &self,
        category: Category,
        symbol: Option<String>,
    ) -> BoxFuture<'_, RestResult<Vec<OpenOrder>>> {
        Box::pin(async move {
            let mut params = BTreeMap::new();
            params.insert("category".to_string(), category.as_str().to_string());
            params.insert("openOnly".to_string(), "0".to_string());
            if let Some(symbol) = symbol {
                params.insert("symbol".to_string(), symbol);
            }
            let result: ListResult<OpenOrder> = self
                .request(HttpMethod::Get, PATH_ORDER_REALTIME, params)
                .await?;
            Ok(result.list)
        })
    }

    fn get_order(
        &self,
        category: Category,
        client_order_id: ClientOrderId,
    ) -> BoxFuture<'_, RestResult<Option<OpenOrder>>> {
        Box::pin(async move {
            let mut params = BTreeMap::new();
            params.insert("category".to_string(), category.as_str().to_string());
            params.insert(
                "orderLinkId".to_string(),
                client_order_id.as_str().to_string(),
            );

            // Recently closed orders may only show up in history
            for path in [PATH_ORDER_REALTIME, PATH_ORDER_HISTORY] {
                let result: ListResult<OpenOrder> = self
                    .request(HttpMethod::Get, path, params.clone())
                    .await?;
                if let Some(order) = result
                    .list
                    .into_iter()
                    .find(|o| o.order_link_id == client_order_id.as_str())
                {
                    return Ok(Some(order));
                }
            }
            debug!(client_order_id = %client_order_id, "Order not known to the exchange");
            Ok(None)
        })
    }

    fn get_wallet_balance(
        &self,
        account_type: String,
    ) -> BoxFuture<'_, RestResult<Vec<WalletBalance>>> {
        Box::pin(async move {
            let mut params = BTreeMap::new();
            params.insert("accountType".to_string(), account_type);
            let result: ListResult<WalletBalance> = self
                .request(HttpMethod::Get, PATH_WALLET_BALANCE, params)
                .await?;
            Ok(result.list)
        })
    }

    fn get_api_key_info(&self) -> BoxFuture<'_, RestResult<ApiKeyInfo>> {
        Box::pin(async move {
            self.request(HttpMethod::Get, PATH_API_KEY_INFO, BTreeMap::new())
                .await
        })
    }
}

// ============================================================================
// MockRestClient
// ============================================================================

/// Mock client for testing.
///
/// Records every request. Scripted results are consumed in order; once a
/// queue is empty, orders are accepted with a generated exchange id.
#[derive(Debug, Default)]
pub struct MockRestClient {
    place_results: Mutex<VecDeque<RestResult<OrderAck>>>,
    cancel_results: Mutex<VecDeque<RestResult<OrderAck>>>,
    placed: Mutex<Vec<PlaceOrderRequest>>,
    cancelled: Mutex<Vec<CancelOrderRequest>>,
    open_orders: Mutex<Vec<OpenOrder>>,
    closed_orders: Mutex<Vec<OpenOrder>>,
    order_lookups: Mutex<Vec<ClientOrderId>>,
    balances: Mutex<Vec<WalletBalance>>,
    api_key_info: Mutex<Option<ApiKeyInfo>>,
    next_order_id: AtomicU64,
}

impl MockRestClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_place_result(&self, result: RestResult<OrderAck>) {
        self.place_results.lock().push_back(result);
    }

    pub fn push_cancel_result(&self, result: RestResult<OrderAck>) {
        self.cancel_results.lock().push_back(result);
    }

    pub fn set_open_orders(&self, orders: Vec<OpenOrder>) {
        *self.open_orders.lock() = orders;
    }

    /// Orders only visible through a single-order lookup.
    pub fn set_closed_orders(&self, orders: Vec<OpenOrder>) {
        *self.closed_orders.lock() = orders;
    }

    /// Ids passed to `get_order` so far.
    pub fn order_lookups(&self) -> Vec<ClientOrderId> {
        self.order_lookups.lock().clone()
    }

    pub fn set_balances(&self, balances: Vec<WalletBalance>) {
        *self.balances.lock() = balances;
    }

    pub fn set_api_key_info(&self, info: ApiKeyInfo) {
        *self.api_key_info.lock() = Some(info);
    }

    /// Place requests received so far, retries included.
    pub fn placed(&self) -> Vec<PlaceOrderRequest> {
        self.placed.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<CancelOrderRequest> {
        self.cancelled.lock().clone()
    }

    fn accept(&self, client_order_id: &ClientOrderId) -> OrderAck {
        let n = self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1;
        OrderAck {
            order_id: format!("mock-{n}"),
            order_link_id: client_order_id.as_str().to_string(),
        }
    }
}

impl RestClient for MockRestClient {
    fn place_order(&self, request: PlaceOrderRequest) -> BoxFuture<'_, RestResult<OrderAck>> {
        Box::pin(async move {
            let scripted = self.place_results.lock().pop_front();
            let result = scripted.unwrap_or_else(|| Ok(self.accept(&request.client_order_id)));
            self.placed.lock().push(request);
            result
        })
    }

    fn cancel_order(&self, request: CancelOrderRequest) -> BoxFuture<'_, RestResult<OrderAck>> {
        Box::pin(async move {
            let scripted = self.cancel_results.lock().pop_front();
            let result = scripted.unwrap_or_else(|| Ok(self.accept(&request.client_order_id)));
            self.cancelled.lock().push(request);
            result
        })
    }

    fn get_open_orders(
        &self,
        _category: Category,
        symbol: Option<String>,
    ) -> BoxFuture<'_, RestResult<Vec<OpenOrder>>> {
        Box::pin(async move {
            let orders = self.open_orders.lock().clone();
            Ok(match symbol {
                Some(symbol) => orders.into_iter().filter(|o| o.symbol == symbol).collect(),
                None => orders,
            })
        })
    }

    fn get_order(
        &self,
        _category: Category,
        client_order_id: ClientOrderId,
    ) -> BoxFuture<'_, RestResult<Option<OpenOrder>>> {
        Box::pin(async move {
            let found = {
                let open = self.open_orders.lock();
                let closed = self.closed_orders.lock();
                open.iter()
                    .chain(closed.iter())
                    .find(|o| o.order_link_id == client_order_id.as_str())
                    .cloned()
            };
            self.order_lookups.lock().push(client_order_id);
            Ok(found)
        })
    }

    fn get_wallet_balance(
        &self,
        account_type: String,
    ) -> BoxFuture<'_, RestResult<Vec<WalletBalance>>> {
        Box::pin(async move {
            Ok(self
                .balances
                .lock()
                .iter()
                .filter(|b| b.account_type == account_type)
                .cloned()
                .collect())
        })
    }

    fn get_api_key_info(&self) -> BoxFuture<'_, RestResult<ApiKeyInfo>> {
        Box::pin(async move {
            self.api_key_info.lock().clone().ok_or(RestError::Exchange {
                code: 10003,
                message: "API key is invalid.".to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytrade_core::OrderSpec;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok, block_on};

    fn market_buy() -> Order {
        Order::new(
            ClientOrderId::from("bt-test-1"),
            OrderSpec::market("BTCUSDT", OrderSide::Buy, Size::new(dec!(0.001))),
            0,
        )
    }

    #[test]
    fn test_place_params_market_spot() {
        let request = PlaceOrderRequest::from_order(&market_buy(), Category::Spot);
        let params = request.to_params();

        assert_eq!(params["category"], "spot");
        assert_eq!(params["side"], "Buy");
        assert_eq!(params["orderType"], "Market");
        assert_eq!(params["qty"], "0.001");
        assert_eq!(params["timeInForce"], "IOC");
        assert_eq!(params["orderLinkId"], "bt-test-1");
        assert_eq!(params["marketUnit"], "baseCoin");
        assert!(!params.contains_key("price"));
    }

    #[test]
    fn test_place_params_limit_linear() {
        let order = Order::new(
            ClientOrderId::from("bt-test-2"),
            OrderSpec::limit(
                "ETHUSDT",
                OrderSide::Sell,
                Size::new(dec!(0.5)),
                Price::new(dec!(2500.5)),
            ),
            0,
        );
        let params = PlaceOrderRequest::from_order(&order, Category::Linear).to_params();

        assert_eq!(params["category"], "linear");
        assert_eq!(params["price"], "2500.5");
        assert_eq!(params["timeInForce"], "GTC");
        assert!(!params.contains_key("marketUnit"));
    }

    #[test]
    fn test_decode_success_envelope() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"orderId":"1321003749386327552","orderLinkId":"bt-test-1"},"retExtInfo":{},"time":1672211918471}"#;
        let ack: OrderAck = decode_response(200, body).unwrap();
        assert_eq!(ack.order_id, "1321003749386327552");
        assert_eq!(ack.order_link_id, "bt-test-1");
    }

    #[test]
    fn test_decode_exchange_error() {
        let body = r#"{"retCode":170131,"retMsg":"Insufficient balance.","result":{},"retExtInfo":{},"time":1672211918471}"#;
        let err = decode_response::<OrderAck>(200, body).unwrap_err();
        assert_eq!(
            err,
            RestError::Exchange {
                code: 170131,
                message: "Insufficient balance.".into()
            }
        );
    }

    #[test]
    fn test_decode_http_status_classes() {
        assert!(matches!(
            decode_response::<OrderAck>(503, "upstream unavailable"),
            Err(RestError::Network(_))
        ));
        assert!(matches!(
            decode_response::<OrderAck>(429, ""),
            Err(RestError::Network(_))
        ));
        assert!(matches!(
            decode_response::<OrderAck>(403, "<html>forbidden</html>"),
            Err(RestError::Exchange { code: 403, .. })
        ));
        let body = r#"{"retCode":10003,"retMsg":"API key is invalid.","result":{}}"#;
        assert!(matches!(
            decode_response::<OrderAck>(401, body),
            Err(RestError::Exchange { code: 10003, .. })
        ));
        assert!(matches!(
            decode_response::<OrderAck>(200, "not json"),
            Err(RestError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_list_results() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"accountType":"UNIFIED","totalEquity":"3.31216591","coin":[{"coin":"BTC","walletBalance":"0.00012","equity":"0.00012","locked":"0"}]}]}}"#;
        let result: ListResult<WalletBalance> = decode_response(200, body).unwrap();
        assert_eq!(result.list.len(), 1);
        let btc = result.list[0].coin("BTC").unwrap();
        assert_eq!(btc.wallet_balance, "0.00012");

        let body = r#"{"retCode":0,"retMsg":"OK","result":{"id":"13770661","note":"bot","apiKey":"XXXXXX","readOnly":0,"userID":24617703,"ips":["*"]}}"#;
        let info: ApiKeyInfo = decode_response(200, body).unwrap();
        assert_eq!(info.user_id, 24617703);
        assert_eq!(info.read_only, 0);
    }

    #[test]
    fn test_open_order_as_update() {
        let open = OpenOrder {
            order_id: "42".into(),
            order_link_id: "bt-test-1".into(),
            symbol: "BTCUSDT".into(),
            side: "Buy".into(),
            order_type: "Limit".into(),
            price: "30000".into(),
            qty: "0.01".into(),
            order_status: "PartiallyFilled".into(),
            cum_exec_qty: "0.004".into(),
            created_time: "1672364262444".into(),
            updated_time: "1672364262457".into(),
        };
        let update = open.to_update();
        assert_eq!(update.updated_time_ms(), Some(1672364262457));
        assert_eq!(update.cum_exec_qty(), Some(Size::new(dec!(0.004))));
        assert_eq!(update.order_status, "PartiallyFilled");
    }

    #[tokio::test]
    async fn test_mock_scripted_then_default() {
        let mock = MockRestClient::new();
        mock.push_place_result(Err(RestError::Network("timeout".into())));

        let request = PlaceOrderRequest::from_order(&market_buy(), Category::Spot);
        assert_err!(mock.place_order(request.clone()).await);
        let ack = assert_ok!(mock.place_order(request).await);
        assert_eq!(ack.order_id, "mock-1");
        assert_eq!(ack.order_link_id, "bt-test-1");
        assert_eq!(mock.placed().len(), 2);

        assert!(matches!(
            mock.get_api_key_info().await,
            Err(RestError::Exchange { code: 10003, .. })
        ));
    }

    #[test]
    fn test_mock_get_order_searches_open_then_closed() {
        let mock = MockRestClient::new();
        let closed = OpenOrder {
            order_id: "mock-7".into(),
            order_link_id: "bt-test-1".into(),
            symbol: "BTCUSDT".into(),
            side: "Buy".into(),
            order_type: "Market".into(),
            price: String::new(),
            qty: "0.001".into(),
            order_status: "Cancelled".into(),
            cum_exec_qty: "0".into(),
            created_time: "1000".into(),
            updated_time: "1200".into(),
        };
        mock.set_closed_orders(vec![closed.clone()]);

        let found = assert_ok!(block_on(
            mock.get_order(Category::Spot, ClientOrderId::from("bt-test-1"))
        ));
        assert_eq!(found, Some(closed));
        let missing = assert_ok!(block_on(
            mock.get_order(Category::Spot, ClientOrderId::from("bt-other"))
        ));
        assert!(missing.is_none());
        assert_eq!(mock.order_lookups().len(), 2);
    }
}
