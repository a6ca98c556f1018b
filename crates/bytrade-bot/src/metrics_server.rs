//! Prometheus scrape endpoint using axum.

use crate::error::AppResult;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytrade_telemetry::Metrics;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CONTENT_TYPE_TEXT: &str = "text/plain; version=0.0.4";

pub fn create_router() -> Router {
    Router::new().route("/metrics", get(get_metrics))
}

async fn get_metrics() -> Response {
    match Metrics::render() {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE_TEXT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Bind the endpoint on all interfaces.
pub async fn bind(port: u16) -> AppResult<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    Ok(TcpListener::bind(addr).await?)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) -> AppResult<()> {
    info!(addr = ?listener.local_addr().ok(), "Starting metrics server");
    axum::serve(listener, create_router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("Metrics server stopped");
    Ok(())
}
