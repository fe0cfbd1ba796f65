//! End-to-end: a browser WebSocket client talks to the server, which bridges
//! to a stand-in speech model served locally over WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::Request,
};
use chorus_db::{create_pool, run_migrations, DbRuntimeSettings};
use chorus_observe::event_types;
use chorus_server::channel::WsConnector;
use chorus_server::config::Config;
use chorus_server::{app, AppState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::protocol::Message};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(10);

/// Accepts one connection, answers `session.update` with `session.updated`
/// and reports every message type it receives.
async fn spawn_fake_model() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            let ty = value["type"].as_str().unwrap_or_default().to_string();
            if ty == "session.update" {
                let reply = json!({"type": "session.updated", "session": {}}).to_string();
                ws.send(Message::Text(reply.into())).await.unwrap();
            }
            let _ = seen_tx.send(ty);
        }
    });

    (addr, seen_rx)
}

async fn next_text<S>(client: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match client.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended: {other:?}"),
        }
    }
}

#[tokio::test]
async fn browser_session_round_trip() {
    let dir = TempDir::new().unwrap();
    let pool = create_pool(
        dir.path().join("e2e.db").to_str().unwrap(),
        DbRuntimeSettings::default(),
    )
    .unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();

    let (model_addr, mut model_seen) = spawn_fake_model().await;
    let mut config = Config::default();
    config.speech_model.url = format!("ws://{model_addr}/v1/realtime");
    let connector = Arc::new(WsConnector::new(
        config.speech_model.clone(),
        config.channels.clone(),
    ));
    let state = AppState::new(pool, config, connector);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let url = format!("ws://{addr}/ws/voice?conversation_id=conv-e2e&turn_mode=manual");
    let (mut client, _) = connect_async(url).await.expect("failed to connect");

    tokio::time::timeout(WAIT, async {
        let ready = loop {
            let message = next_text(&mut client).await;
            if message["type"] == "session.ready" {
                break message;
            }
        };
        assert_eq!(ready["conversation_id"], "conv-e2e");

        // The model's reply is relayed to the browser.
        loop {
            if next_text(&mut client).await["type"] == "session.updated" {
                break;
            }
        }
    })
    .await
    .expect("session never became ready");

    assert_eq!(model_seen.recv().await.unwrap(), "session.update");

    // 200 ms of 48 kHz mono speech, then an explicit commit.
    let chunk: Vec<u8> = std::iter::repeat(9_000i16.to_le_bytes())
        .take(960)
        .flatten()
        .collect();
    for _ in 0..10 {
        client.send(Message::Binary(chunk.clone().into())).await.unwrap();
    }
    client
        .send(Message::Text(
            json!({"type": "input_audio_buffer.commit"}).to_string().into(),
        ))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        while !seen.iter().any(|t| t == "response.create") {
            seen.push(model_seen.recv().await.unwrap());
        }
        assert!(seen.iter().any(|t| t == "input_audio_buffer.append"));
        assert!(seen.iter().any(|t| t == "input_audio_buffer.commit"));
    })
    .await
    .expect("turn was never flushed to the model");

    client
        .send(Message::Text(json!({"type": "session.stop"}).to_string().into()))
        .await
        .unwrap();

    // The log is complete once the session has recorded its end.
    let events = tokio::time::timeout(WAIT, async {
        loop {
            let response = app(state.clone())
                .oneshot(
                    Request::builder()
                        .uri("/api/conversations/conv-e2e/events?limit=1000")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let json: Value = serde_json::from_slice(&body).unwrap();
            let events = json["events"].as_array().cloned().unwrap_or_default();
            if events
                .iter()
                .any(|e| e["event_type"] == event_types::SESSION_ENDED)
            {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session end was never recorded");

    let types: Vec<&str> = events
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert!(types.contains(&event_types::SESSION_STARTED));
    assert!(types.contains(&event_types::TURN_COMMITTED));
    assert!(types.contains(&"session.updated"));
    assert_eq!(*types.last().unwrap(), event_types::SESSION_ENDED);
    assert!(events
        .windows(2)
        .all(|w| w[0]["seq"].as_i64().unwrap() < w[1]["seq"].as_i64().unwrap()));

    tokio::time::timeout(WAIT, async {
        while state.active_sessions() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session stayed registered after it ended");
}
