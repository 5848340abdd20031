use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::pool::PoolStatus;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    pub idle: usize,
    pub running: usize,
    pub capacity: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub endpoints: Vec<PoolStatus>,
    pub workers: WorkerStatus,
}

/// GET /status - idle capacity of every pool
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        endpoints: state.pools.status(),
        workers: WorkerStatus {
            idle: state.workers.idle_slots(),
            running: state.workers.running(),
            capacity: state.workers.capacity(),
        },
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .with_state(state)
}
