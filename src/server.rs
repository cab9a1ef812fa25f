//! HTTP endpoints for health checks, service info, and the webhook inbox.

use anyhow::Result;
use axum::{
    extract::State,
    http::header,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tracing::error;

use crate::dispatch::Dispatcher;
use crate::update::Update;

#[derive(Clone)]
struct HttpState {
    dispatcher: Arc<Dispatcher>,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Start an HTTP server exposing `/healthz`, `/webhook`, and service info.
pub async fn serve_http(
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let state = Arc::new(HttpState { dispatcher });
    let app = Router::new()
        .route("/", get(service_info))
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook))
        .with_state(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Acknowledgement returned to the chat transport for every delivery.
#[derive(Serialize, Deserialize)]
struct Ack {
    ok: bool,
}

/// Accept one webhook delivery and hand it to the dispatcher.
///
/// The transport retries deliveries that do not get a prompt 200, so the
/// update is processed on a spawned task and acknowledged immediately.
async fn webhook(State(state): State<Arc<HttpState>>, Json(update): Json<Update>) -> Json<Ack> {
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        if let Err(err) = dispatcher.dispatch(update).await {
            error!("webhook update failed: {err:#}");
        }
    });
    Json(Ack { ok: true })
}

/// Minimal service information document.
#[derive(Serialize, Deserialize)]
struct ServiceInfo {
    /// Human-readable service name.
    name: String,
    /// Software identifier (here it is always "okolo").
    software: String,
    /// Semantic version string such as "0.1.0".
    version: String,
}

/// Basic service information document.
async fn service_info() -> impl axum::response::IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(ServiceInfo {
            name: "okolo".into(),
            software: "okolo".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }),
    )
}
