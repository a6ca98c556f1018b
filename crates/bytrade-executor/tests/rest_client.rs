//! Signed REST client tests against a one-shot local HTTP server.

use bytrade_core::{
    ClientOrderId, Credential, HttpMethod, ManualClock, Order, OrderSide, OrderSpec, Signer, Size,
};
use bytrade_executor::{
    BybitRestClient, Category, PlaceOrderRequest, RestClient, RestConfig, RestError,
};
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const NOW_MS: u64 = 1_700_000_000_000;

/// A request as seen by the server.
#[derive(Debug)]
struct Captured {
    request_line: String,
    headers: HashMap<String, String>,
    body: String,
}

/// Serve a single request with `status` and `body`, then close.
async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed early");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap().to_string();
        let headers: HashMap<String, String> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        let content_length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        let body_in = String::from_utf8_lossy(&buf[header_end..header_end + content_length]).to_string();

        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();

        let _ = tx.send(Captured {
            request_line,
            headers,
            body: body_in,
        });
    });

    (format!("http://{addr}"), rx)
}

fn signer() -> Signer {
    Signer::new(Credential::new("test-key", "test-secret")).unwrap()
}

fn client(base_url: String) -> BybitRestClient {
    BybitRestClient::with_clock(
        RestConfig {
            base_url,
            recv_window_ms: 5_000,
            timeout: Duration::from_secs(5),
        },
        signer(),
        Arc::new(ManualClock::new(NOW_MS)),
    )
    .unwrap()
}

#[tokio::test]
async fn test_place_order_is_header_signed_over_exact_body() {
    let (url, captured) = serve_once(
        "200 OK",
        r#"{"retCode":0,"retMsg":"OK","result":{"orderId":"1321003749386327552","orderLinkId":"bt-test-1"}}"#,
    )
    .await;

    let order = Order::new(
        ClientOrderId::from("bt-test-1"),
        OrderSpec::market("BTCUSDT", OrderSide::Buy, Size::new(dec!(0.001))),
        0,
    );
    let request = PlaceOrderRequest::from_order(&order, Category::Spot);
    let ack = client(url).place_order(request.clone()).await.unwrap();
    assert_eq!(ack.order_id, "1321003749386327552");

    let captured = captured.await.unwrap();
    assert_eq!(captured.request_line, "POST /v5/order/create HTTP/1.1");
    assert_eq!(captured.headers["x-bapi-api-key"], "test-key");
    assert_eq!(captured.headers["x-bapi-timestamp"], NOW_MS.to_string());
    assert_eq!(captured.headers["x-bapi-recv-window"], "5000");
    assert_eq!(captured.headers["x-bapi-sign-type"], "2");

    let expected = signer()
        .sign_request(
            HttpMethod::Post,
            "/v5/order/create",
            request.to_params(),
            NOW_MS,
            5_000,
        )
        .unwrap();
    assert_eq!(Some(captured.body.clone()), expected.body);
    assert_eq!(captured.headers["x-bapi-sign"], expected.signature);

    let sent: serde_json::Value = serde_json::from_str(&captured.body).unwrap();
    assert_eq!(sent["orderLinkId"], "bt-test-1");
    assert_eq!(sent["timeInForce"], "IOC");
}

#[tokio::test]
async fn test_get_signs_query_string() {
    let (url, captured) = serve_once(
        "200 OK",
        r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"accountType":"UNIFIED","totalEquity":"10.5","coin":[]}]}}"#,
    )
    .await;

    let balances = client(url)
        .get_wallet_balance("UNIFIED".to_string())
        .await
        .unwrap();
    assert_eq!(balances[0].total_equity, "10.5");

    let captured = captured.await.unwrap();
    assert_eq!(
        captured.request_line,
        "GET /v5/account/wallet-balance?accountType=UNIFIED HTTP/1.1"
    );
    let mut params = std::collections::BTreeMap::new();
    params.insert("accountType".to_string(), "UNIFIED".to_string());
    let expected = signer()
        .sign_request(
            HttpMethod::Get,
            "/v5/account/wallet-balance",
            params,
            NOW_MS,
            5_000,
        )
        .unwrap();
    assert_eq!(captured.headers["x-bapi-sign"], expected.signature);
    assert!(captured.body.is_empty());
}

#[tokio::test]
async fn test_exchange_error_and_server_error() {
    let (url, _captured) = serve_once(
        "200 OK",
        r#"{"retCode":10003,"retMsg":"API key is invalid.","result":{}}"#,
    )
    .await;
    let err = client(url).get_api_key_info().await.unwrap_err();
    assert_eq!(
        err,
        RestError::Exchange {
            code: 10003,
            message: "API key is invalid.".to_string()
        }
    );

    let (url, _captured) = serve_once("502 Bad Gateway", "bad gateway").await;
    let err = client(url).get_api_key_info().await.unwrap_err();
    assert!(matches!(err, RestError::Network(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_unreachable_host_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(format!("http://{addr}"))
        .get_open_orders(Category::Spot, Some("BTCUSDT".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, RestError::Network(_)));
}

#[tokio::test]
async fn test_get_order_queries_by_link_id() {
    let (url, captured) = serve_once(
        "200 OK",
        r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"orderId":"1321003749386327552","orderLinkId":"bt-test-1","symbol":"BTCUSDT","side":"Buy","orderType":"Market","qty":"0.001","orderStatus":"Filled","cumExecQty":"0.001","updatedTime":"1700000000100"}]}}"#,
    )
    .await;

    let order = client(url)
        .get_order(Category::Spot, ClientOrderId::from("bt-test-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.order_status, "Filled");
    assert_eq!(order.to_update().updated_time_ms(), Some(1_700_000_000_100));

    let captured = captured.await.unwrap();
    assert_eq!(
        captured.request_line,
        "GET /v5/order/realtime?category=spot&orderLinkId=bt-test-1 HTTP/1.1"
    );
}
