//! Server-sent event stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::api::error::ApiResult;
use crate::api::models::SubscriberQuery;
use crate::api::server::AppState;
use crate::database::models::EventDbModel;
use crate::delivery::{DeliveryStream, resolve_cursor};

const LAST_EVENT_ID: &str = "last-event-id";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events", get(stream_events))
        // Path used by older clients.
        .route("/sse", get(stream_events))
}

/// Parse a `Last-Event-ID` header. Unparseable values are ignored.
fn resume_ordinal(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
}

fn to_sse_event(event: &EventDbModel) -> Event {
    let event_frame = Event::default()
        .id(event.ordinal.to_string())
        .event("message");
    match serde_json::to_string(event) {
        Ok(data) => event_frame.data(data),
        Err(e) => {
            warn!(ordinal = event.ordinal, error = %e, "Failed to serialize event");
            event_frame.data("{}")
        }
    }
}

/// Stream the subscriber's events, resuming after `Last-Event-ID` or the
/// persisted cursor.
#[utoipa::path(
    get,
    path = "/api/v1/events",
    tag = "events",
    params(
        SubscriberQuery,
        ("Last-Event-ID" = Option<i64>, Header, description = "Resume after this ordinal")
    ),
    responses(
        (status = 200, description = "text/event-stream of events", body = EventDbModel, content_type = "text/event-stream"),
        (status = 400, description = "Missing or invalid subscriber", body = crate::api::error::ApiErrorResponse)
    )
)]
pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<SubscriberQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscriber = query.subscriber()?;
    let cursor = resolve_cursor(
        state.credentials.as_ref(),
        subscriber,
        resume_ordinal(&headers),
    )
    .await?;

    debug!(subscriber = %subscriber, cursor, "Event stream opened");
    let events = DeliveryStream::new(
        subscriber,
        cursor,
        state.credentials.clone(),
        state.events.clone(),
        state.delivery_config(),
    )
    .into_stream(state.shutdown.child_token())
    .map(|event| Ok(to_sse_event(&event)));

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}
