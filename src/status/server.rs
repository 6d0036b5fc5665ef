//! HTTP status endpoint

use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;

use super::StatusReader;
use crate::sync::ShutdownSignal;

/// Loopback only; the surface has no authentication
pub const DEFAULT_STATUS_ADDR: &str = "127.0.0.1:8085";

/// Serves `/status` and `/health`
pub struct StatusServer {
    reader: StatusReader,
    addr: SocketAddr,
}

impl StatusServer {
    pub fn new(reader: StatusReader, addr: SocketAddr) -> Self {
        Self { reader, addr }
    }

    /// Build the router
    pub fn router(reader: StatusReader) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(reader)
    }

    /// Serve until `signal` fires
    pub async fn start(self, signal: ShutdownSignal) -> std::io::Result<()> {
        let app = Self::router(self.reader);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("Status server listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.stopped().await })
            .await?;

        tracing::info!("Status server stopped");
        Ok(())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status_handler(State(reader): State<StatusReader>) -> Response {
    match tokio::task::spawn_blocking(move || reader.snapshot()).await {
        Ok(Ok(outcomes)) => Json(outcomes).into_response(),
        Ok(Err(e)) => {
            tracing::warn!("Status query failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Status query task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
