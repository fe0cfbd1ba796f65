//! Browser voice endpoint: `GET /ws/voice`.
//!
//! Upgrades to a WebSocket and runs one voice session over it. Binary
//! frames carry raw PCM in both directions; text frames carry JSON control
//! messages and relayed speech model events.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chorus_types::TurnMode;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::channel::{ChannelFrame, ChannelLink, CHANNEL_QUEUE_CAPACITY};
use crate::session::{run_session, SessionParams};
use crate::AppState;

/// Query parameters for `GET /ws/voice`.
#[derive(Debug, Deserialize)]
pub struct VoiceConnectParams {
    /// Conversation to record into. A new one is created when absent.
    pub conversation_id: Option<String>,
    /// `automatic` or `manual`. Defaults to `voice.turn_mode`.
    pub turn_mode: Option<String>,
}

/// Handler for `GET /ws/voice`.
pub async fn voice_ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<VoiceConnectParams>,
) -> Response {
    let turn_mode = match params.turn_mode.as_deref() {
        Some(raw) => match raw.parse::<TurnMode>() {
            Ok(mode) => mode,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
                    .into_response();
            }
        },
        None => state.config.voice.turn_mode,
    };

    let conversation_id = params
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let session = SessionParams {
        session_id: uuid::Uuid::new_v4().to_string(),
        conversation_id,
        turn_mode,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, session))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: SessionParams) {
    let session_id = params.session_id.clone();
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ChannelFrame>(CHANNEL_QUEUE_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ChannelFrame>(CHANNEL_QUEUE_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                ChannelFrame::Text(text) => AxumMessage::Text(text.into()),
                ChannelFrame::Binary(bytes) => AxumMessage::Binary(bytes.into()),
            };
            if sink.send(message).await.is_err() {
                return;
            }
        }
        let _ = sink.send(AxumMessage::Close(None)).await;
    });

    let recv_session_id = session_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                AxumMessage::Binary(bytes) => {
                    // Audio is dropped rather than queued behind a slow session.
                    match inbound_tx.try_send(ChannelFrame::Binary(bytes.to_vec())) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::debug!(
                                session_id = %recv_session_id,
                                "session busy; browser audio dropped"
                            );
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                AxumMessage::Text(text) => {
                    if inbound_tx
                        .send(ChannelFrame::Text(text.as_str().to_owned()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                AxumMessage::Close(_) => break,
                AxumMessage::Ping(_) | AxumMessage::Pong(_) => {}
            }
        }
    });

    let link = ChannelLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
    };
    if let Err(e) = run_session(state, link, params).await {
        tracing::error!(session_id = %session_id, error = %e, "voice session failed to start");
    }

    recv_task.abort();
    if tokio::time::timeout(std::time::Duration::from_secs(2), send_task)
        .await
        .is_err()
    {
        tracing::debug!(session_id = %session_id, "browser socket did not drain before close");
    }
}
