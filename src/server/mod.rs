//! JSON-over-HTTP surface consumed by the map client.

mod handlers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::db::Database;
use crate::error::ClusterError;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

impl AppState {
    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/merge", post(handlers::merge))
        .route("/split", post(handlers::split))
        .route("/update", post(handlers::update))
        .route("/clusters", get(handlers::clusters))
        .route("/points", get(handlers::points))
        .route("/health", get(handlers::health))
        .layer(cors)
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(listener: TcpListener, router: Router) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!(%addr, "Listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

impl ClusterError {
    pub fn status(&self) -> StatusCode {
        match self {
            ClusterError::InvalidRequest(_) | ClusterError::Geometry(_) => StatusCode::BAD_REQUEST,
            ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::Conflict(_) => StatusCode::CONFLICT,
            ClusterError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = json!({
            "success": false,
            "error": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
