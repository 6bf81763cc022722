use crate::agent::AgentHandle;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tab_relay_common::StateStore;

/// Local introspection surface: status, manual reconnect, activity log and
/// Prometheus metrics
#[derive(Clone)]
pub struct StatusServer {
    handle: AgentHandle,
    store: Arc<dyn StateStore>,
}

impl StatusServer {
    pub fn new(handle: AgentHandle, store: Arc<dyn StateStore>) -> Self {
        Self { handle, store }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/reconnect", post(reconnect_handler))
            .route("/logs", get(logs_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
    }

    /// Start HTTP server on specified port
    pub async fn start(self, port: u16) -> anyhow::Result<()> {
        let app = self.router();

        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Status server listening on {}", addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn status_handler(State(server): State<StatusServer>) -> Response {
    match server.handle.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn reconnect_handler(State(server): State<StatusServer>) -> Response {
    match server.handle.reconnect().await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"reconnecting": true}))).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn logs_handler(State(server): State<StatusServer>) -> Response {
    match server.store.logs().await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => {
            tracing::error!("Failed to read activity log: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn metrics_handler(State(server): State<StatusServer>) -> Response {
    match server.handle.metrics().encode() {
        Ok(buffer) => (StatusCode::OK, buffer).into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response()
        }
    }
}
