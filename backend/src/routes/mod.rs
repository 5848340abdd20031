//! HTTP surface.

pub mod chat;
pub mod completions;
pub mod generate;
pub mod health;
pub mod status;
pub mod tasks;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::logging::request_logger;
use crate::AppState;

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router())
        .merge(status::router(state.clone()))
        .merge(chat::router(state.clone()))
        .merge(completions::router(state.clone()))
        .merge(generate::router(state.clone()))
        .merge(tasks::router(state))
        .layer(middleware::from_fn(request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
