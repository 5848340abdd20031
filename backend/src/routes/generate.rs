use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;

use crate::error::Result;
use crate::pool::AcquireMode;
use crate::relay::PromptRequest;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub text: String,
}

/// POST /v1/generate/:kind - prompt completion
///
/// Both the prompt and the generated text go through moderation. Busy
/// endpoints answer 503 right away.
async fn generate(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(request): Json<PromptRequest>,
) -> Result<Json<GenerateResponse>> {
    let text = state
        .generation
        .invoke(&kind, &request, AcquireMode::NonBlocking)
        .await?;
    Ok(Json(GenerateResponse { text }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/generate/:kind", post(generate))
        .with_state(state)
}
