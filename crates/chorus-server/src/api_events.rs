//! Conversation event API.
//!
//! Provides:
//! - `GET /api/conversations/{id}/events`: filtered, paged retrieval
//! - `GET /api/conversations/{id}/events/export`: the whole timeline as NDJSON
//! - `GET /api/conversations/{id}/events/stream`: live SSE stream
//! - `DELETE /api/conversations/{id}/events`: removes a conversation's log

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use chorus_observe::{
    delete_conversation_events, query_events, ConversationEvent, EventFilter, ObserveError,
};
use chorus_types::SourceTag;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::AppState;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

/// Query parameters for `GET /api/conversations/{id}/events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Filter by source tag (`voice`, `team`, `coder`, `browser`, `system`).
    pub source: Option<String>,
    /// Filter by event type.
    pub event_type: Option<String>,
    /// Return events with `seq` strictly greater than this.
    pub after_seq: Option<i64>,
    /// Maximum number of events to return (default: 100, max: 1000).
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub conversation_id: String,
    /// The matching events in arrival order.
    pub events: Vec<ConversationEvent>,
    pub count: usize,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn parse_source(raw: Option<&str>) -> Result<Option<SourceTag>, Response> {
    raw.map(|s| {
        s.parse::<SourceTag>().map_err(|e| {
            error_response(
                StatusCode::BAD_REQUEST,
                format!("{e}. Expected one of: voice, team, coder, browser, system"),
            )
        })
    })
    .transpose()
}

/// Runs a blocking query against the pool.
async fn with_conn<T, F>(state: &AppState, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, ObserveError> + Send + 'static,
{
    let pool = state.pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        f(&*conn).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("task join error: {e}"),
        )
    })?
    .map_err(|e| {
        tracing::warn!(error = %e, "event query failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
    })
}

/// Handler for `GET /api/conversations/{id}/events`.
pub async fn get_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, Response> {
    let filter = EventFilter {
        source: parse_source(params.source.as_deref())?,
        event_type: params.event_type,
        after_seq: params.after_seq,
        limit: Some(params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)),
    };

    let id = conversation_id.clone();
    let events = with_conn(&state, move |conn| query_events(conn, &id, &filter)).await?;
    let count = events.len();
    Ok(Json(EventsResponse {
        conversation_id,
        events,
        count,
    }))
}

/// Handler for `GET /api/conversations/{id}/events/export`.
///
/// One JSON event per line, in `seq` order, with no paging.
pub async fn export_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Response, Response> {
    let id = conversation_id.clone();
    let events = with_conn(&state, move |conn| {
        query_events(conn, &id, &EventFilter::default())
    })
    .await?;

    let mut body = String::new();
    for event in &events {
        let line = serde_json::to_string(event).map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
        body.push_str(&line);
        body.push('\n');
    }
    tracing::info!(
        conversation_id = %conversation_id,
        count = events.len(),
        "exported conversation events"
    );

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response())
}

/// Handler for `DELETE /api/conversations/{id}/events`.
pub async fn delete_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let id = conversation_id.clone();
    let deleted =
        with_conn(&state, move |conn| delete_conversation_events(conn, &id)).await?;
    tracing::info!(conversation_id = %conversation_id, deleted, "deleted conversation events");
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

/// Query parameters for `GET /api/conversations/{id}/events/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub source: Option<String>,
}

/// Handler for `GET /api/conversations/{id}/events/stream`.
///
/// Streams the conversation's events as they are recorded. Subscribers that
/// fall behind skip the events they missed; the persisted log is complete.
pub async fn get_event_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(params): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let source_filter = parse_source(params.source.as_deref())?;

    let stream = BroadcastStream::new(state.events_tx.subscribe()).filter_map(move |result| {
        let event = result.ok()?;
        if event.conversation_id != conversation_id {
            return None;
        }
        if source_filter.is_some_and(|source| event.source != source) {
            return None;
        }
        match serde_json::to_string(&event) {
            Ok(data) => Some(Ok(Event::default()
                .event(event.event_type.clone())
                .id(event.seq.to_string())
                .data(data))),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize conversation event");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
