use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bigmodel_common::Task;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub owner: String,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RankResponse {
    pub rank: usize,
}

/// POST /v1/tasks/:kind - queue a batch task
async fn create_task(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>)> {
    state.pools.get(&kind)?;
    if request.owner.trim().is_empty() {
        return Err(Error::InvalidRequest("owner must not be empty".to_string()));
    }

    let task = Task::new(kind, request.owner, request.payload);
    state.tasks.insert(task.clone()).await?;
    tracing::info!("Queued task {} ({}) for {}", task.id, task.kind, task.owner);

    Ok((StatusCode::ACCEPTED, Json(task)))
}

/// GET /v1/tasks/:kind/rank?owner= - queue position of the owner's oldest waiting task
async fn rank(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<RankResponse>> {
    let rank = state.tasks.waiting_rank(&query.owner, &kind).await?;
    Ok(Json(RankResponse { rank }))
}

/// GET /v1/tasks/:kind/last?owner= - the owner's latest finished task
async fn last_finished(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Option<Task>>> {
    let task = state.tasks.last_finished(&query.owner, &kind).await?;
    Ok(Json(task))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/tasks/:kind", post(create_task))
        .route("/v1/tasks/:kind/rank", get(rank))
        .route("/v1/tasks/:kind/last", get(last_finished))
        .with_state(state)
}
