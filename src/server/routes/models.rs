//! Model listing endpoint

use crate::error::Result;
use crate::server::state::ServerState;
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};

pub fn create_router() -> Router<ServerState> {
    Router::new().route("/v1/models", get(list_models))
}

/// File names in the models directory, one per line.
async fn list_models(State(state): State<ServerState>) -> Result<impl IntoResponse> {
    let models = state.registry().available_models().await?;
    let body: String = models.into_iter().map(|name| name + "\n").collect();
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body))
}
