use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Json, Router,
};
use bigmodel_common::StreamEvent;
use futures_util::{Stream, StreamExt};

use crate::error::Result;
use crate::pool::AcquireMode;
use crate::relay::ChatRequest;
use crate::AppState;

fn to_sse(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    match event {
        StreamEvent::Token { .. } => Event::default().data(data),
        terminal => Event::default().event(terminal.name()).data(data),
    }
}

/// POST /v1/chat/:kind - stream a chat reply as server-sent events
///
/// Waits for a free endpoint. Dropping the connection cancels the session.
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let cancel = state.shutdown.child_token();
    let session = state
        .chat_relay
        .start(&kind, &request, AcquireMode::Blocking, cancel.clone())
        .await?;

    tracing::debug!("Chat session {} started on {}", session.id(), kind);

    let guard = cancel.drop_guard();
    let events = session.into_stream().map(move |event| {
        let _session = &guard;
        Ok(to_sse(&event))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/:kind", post(chat_stream))
        .with_state(state)
}
