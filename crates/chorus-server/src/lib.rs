//! Chorus server library logic.
//!
//! One voice session per browser WebSocket. Each session bridges the
//! browser to the hosted speech model and routes the model's tool calls to
//! the agent team and coding agent channels.

pub mod api_events;
pub mod api_voice;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod realtime;
pub mod session;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::{routing::get, Extension, Json, Router};
use chorus_db::DbPool;
use chorus_observe::{ConversationEvent, RecorderRegistry};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::channel::ChannelConnector;
use crate::config::Config;

/// Capacity of the live event broadcast channel.
pub const EVENT_BROADCAST_CAPACITY: usize = 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// Opens the speech model, team and coder channels for each session.
    pub connector: Arc<dyn ChannelConnector>,
    /// Every recorded event, for live SSE subscribers.
    pub events_tx: broadcast::Sender<ConversationEvent>,
    /// One shared recorder per conversation with a live session.
    pub recorders: RecorderRegistry,
    /// Active sessions (session id -> conversation id).
    ///
    /// `std::sync::RwLock`: every acquisition is a short map operation that
    /// never spans an `.await`.
    pub sessions: Arc<RwLock<HashMap<String, String>>>,
}

impl AppState {
    pub fn new(pool: DbPool, config: Config, connector: Arc<dyn ChannelConnector>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let recorders = RecorderRegistry::new(pool.clone(), events_tx.clone());
        Self {
            pool,
            config: Arc::new(config),
            connector,
            events_tx,
            recorders,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn active_sessions(&self) -> usize {
        match self.sessions.read() {
            Ok(sessions) => sessions.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Registers a live session. It stays registered until the returned
    /// guard is dropped.
    pub fn register_session(
        &self,
        session_id: &str,
        conversation_id: &str,
    ) -> SessionRegistration {
        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.insert(session_id.to_string(), conversation_id.to_string());
        SessionRegistration {
            sessions: self.sessions.clone(),
            session_id: session_id.to_string(),
        }
    }
}

/// Removes a session from [`AppState::sessions`] on drop.
pub struct SessionRegistration {
    sessions: Arc<RwLock<HashMap<String, String>>>,
    session_id: String,
}

impl Drop for SessionRegistration {
    fn drop(&mut self) {
        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.remove(&self.session_id);
    }
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.active_sessions(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/voice", get(api_voice::voice_ws_handler))
        .route(
            "/api/conversations/{conversationId}/events",
            get(api_events::get_events_handler).delete(api_events::delete_events_handler),
        )
        .route(
            "/api/conversations/{conversationId}/events/export",
            get(api_events::export_events_handler),
        )
        .route(
            "/api/conversations/{conversationId}/events/stream",
            get(api_events::get_event_stream_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! File-backed databases and recorders for unit tests.

    use std::sync::Arc;

    use chorus_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
    use chorus_observe::{query_events, ConversationEvent, EventFilter, EventRecorder};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    pub struct TestDb {
        pub pool: DbPool,
        _dir: TempDir,
    }

    impl TestDb {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("chorus-test.db");
            let pool = create_pool(
                path.to_str().unwrap(),
                DbRuntimeSettings {
                    busy_timeout_ms: 5000,
                    pool_max_size: 4,
                },
            )
            .unwrap();
            run_migrations(&pool.get().unwrap()).unwrap();
            Self { pool, _dir: dir }
        }

        pub fn events(&self, conversation_id: &str) -> Vec<ConversationEvent> {
            let conn = self.pool.get().unwrap();
            query_events(&conn, conversation_id, &EventFilter::default()).unwrap()
        }
    }

    pub async fn recorder(conversation_id: &str) -> (Arc<EventRecorder>, TestDb) {
        let db = TestDb::new();
        let (live_tx, _) = broadcast::channel(64);
        let (recorder, _writer) = EventRecorder::start(db.pool.clone(), conversation_id, live_tx)
            .await
            .unwrap();
        (Arc::new(recorder), db)
    }
}
