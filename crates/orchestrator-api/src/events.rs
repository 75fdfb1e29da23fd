//! `GET /events` — SSE stream bridging the broadcaster to clients.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, Stream};
use tracing::info;

use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new().route("/events", get(stream_events)).with_state(state)
}

/// Each message is `event: <type>\ndata: <json>\n\n`. The stream ends
/// only when the broadcaster shuts down; a client disconnect drops the subscription,
/// which unregisters itself from the broadcaster.
#[utoipa::path(
    get,
    path = "/events",
    responses(
        (status = 200, description = "Server-sent event stream", content_type = "text/event-stream"),
    ),
    tag = "events"
)]
pub async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.broadcaster.subscribe().await;
    info!(subscription_id = subscription.id(), "client subscribed to event stream");

    let stream = stream::unfold(subscription, |subscription| async move {
        let event = subscription.recv().await?;
        let json = serde_json::to_string(&event.payload).unwrap_or_else(|_| "{}".to_string());
        let sse_event = SseEvent::default().event(event.event_type).data(json);
        Some((Ok(sse_event), subscription))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
