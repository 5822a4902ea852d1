//! HTTP server
//!
//! - `GET /v1/models` lists model files
//! - `POST /instruction` and `POST /continuation` stream generated text
//! - `GET /health` reports the active model

use anyhow::Result;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

pub mod middleware;
pub mod routes;
pub mod state;

use state::ServerState;

/// Create the main application router
pub fn create_app(state: ServerState) -> Router {
    let timeout_secs = state.settings.server.request_timeout_secs;

    let mut app = Router::new()
        .route("/health", get(health_check))
        .merge(routes::models::create_router())
        .merge(routes::generation::create_router())
        .layer(axum::middleware::from_fn(middleware::logging_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Streams are long-lived, so there is no timeout unless one is configured.
    if timeout_secs > 0 {
        app = app.layer(TimeoutLayer::new(Duration::from_secs(timeout_secs)));
    }

    app
}

/// Health check endpoint
async fn health_check(State(state): State<ServerState>) -> impl IntoResponse {
    let session = state.registry().active();
    Json(serde_json::json!({
        "status": "healthy",
        "service": "ggml-api",
        "version": env!("CARGO_PKG_VERSION"),
        "model": session.model_name(),
        "busy": session.is_busy(),
    }))
}

/// Serve until ctrl-c, then dispose the loaded model.
pub async fn start_server(addr: SocketAddr, state: ServerState) -> Result<()> {
    let registry = state.registry().clone();
    let app = create_app(state);

    info!("Starting ggml-api server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
