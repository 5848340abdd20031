use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde_json::Value;

use crate::error::Result;
use crate::pool::AcquireMode;
use crate::AppState;

/// POST /v1/completions/:kind - one request, one response
///
/// Fails fast with 503 when every endpoint of the kind is busy.
async fn complete(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>> {
    let response = state
        .completions
        .invoke(&kind, &payload, AcquireMode::NonBlocking)
        .await?;
    Ok(Json(response))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/completions/:kind", post(complete))
        .with_state(state)
}
