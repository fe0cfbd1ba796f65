//! The live, per-session event recorder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chorus_db::DbPool;
use chorus_types::SourceTag;
use chrono::{SecondsFormat, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::ObserveError;
use crate::event::ConversationEvent;
use crate::store::{insert_event, next_seq};

enum WriterCommand {
    Append(ConversationEvent),
    Flush(oneshot::Sender<()>),
}

/// Records conversation events for one conversation.
///
/// Sessions obtain recorders through a [`RecorderRegistry`]; two recorders
/// started independently on the same conversation would hand out the same
/// sequence numbers.
///
/// [`record`](Self::record) assigns the sequence number and enqueues the
/// event under one lock, so the sequence order, the persisted order, and the
/// live broadcast order all equal the order in which callers reached the
/// recorder. Persistence happens on a single writer task; a failed write is
/// logged and never surfaces to the caller.
pub struct EventRecorder {
    conversation_id: String,
    next_seq: Mutex<i64>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    live_tx: broadcast::Sender<ConversationEvent>,
}

impl EventRecorder {
    /// Creates a recorder for `conversation_id` and spawns its writer task.
    ///
    /// Sequence numbers continue from whatever the conversation already has
    /// on disk, so a resumed conversation keeps one timeline.
    ///
    /// # Errors
    ///
    /// Returns `ObserveError` if the existing sequence cannot be read.
    pub async fn start(
        pool: DbPool,
        conversation_id: impl Into<String>,
        live_tx: broadcast::Sender<ConversationEvent>,
    ) -> Result<(Self, JoinHandle<()>), ObserveError> {
        let conversation_id = conversation_id.into();

        let lookup_pool = pool.clone();
        let lookup_id = conversation_id.clone();
        let first_seq = tokio::task::spawn_blocking(move || {
            let conn = lookup_pool.get()?;
            next_seq(&conn, &lookup_id)
        })
        .await
        .map_err(|e| ObserveError::Task(e.to_string()))??;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(pool, writer_rx));

        Ok((
            Self {
                conversation_id,
                next_seq: Mutex::new(first_seq),
                writer_tx,
                live_tx,
            },
            writer,
        ))
    }

    /// The conversation this recorder writes to.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Records one event and returns it. Never fails.
    pub fn record(
        &self,
        source: SourceTag,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> ConversationEvent {
        let mut next = match self.next_seq.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let event = ConversationEvent {
            conversation_id: self.conversation_id.clone(),
            seq: *next,
            source,
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        *next += 1;

        if self
            .writer_tx
            .send(WriterCommand::Append(event.clone()))
            .is_err()
        {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                seq = event.seq,
                "event writer has stopped; event not persisted"
            );
        }
        // No subscribers is the normal case outside of live dashboards.
        let _ = self.live_tx.send(event.clone());

        event
    }

    /// Waits until every event recorded so far has been handed to the
    /// database (successfully or not).
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.writer_tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Subscribes to events as they are recorded.
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.live_tx.subscribe()
    }
}

async fn run_writer(pool: DbPool, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Append(event) => {
                let pool = pool.clone();
                let conversation_id = event.conversation_id.clone();
                let seq = event.seq;
                let result = tokio::task::spawn_blocking(move || {
                    let conn = pool.get()?;
                    insert_event(&conn, &event)
                })
                .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            seq,
                            "failed to persist conversation event: {}",
                            e
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            conversation_id = %conversation_id,
                            seq,
                            "event writer task failed: {}",
                            e
                        );
                    }
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

struct RegistryEntry {
    recorder: Weak<EventRecorder>,
    writer: JoinHandle<()>,
}

/// Hands out one shared [`EventRecorder`] per conversation.
///
/// Every live session on a conversation records through the same recorder,
/// so they draw from one sequence. Once the last session lets go, the next
/// acquire waits for the old writer to finish before reading the stored
/// sequence again.
#[derive(Clone)]
pub struct RecorderRegistry {
    pool: DbPool,
    live_tx: broadcast::Sender<ConversationEvent>,
    entries: Arc<AsyncMutex<HashMap<String, RegistryEntry>>>,
}

impl RecorderRegistry {
    pub fn new(pool: DbPool, live_tx: broadcast::Sender<ConversationEvent>) -> Self {
        Self {
            pool,
            live_tx,
            entries: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// Returns the conversation's live recorder, starting one if none is
    /// held by any session.
    ///
    /// # Errors
    ///
    /// Returns `ObserveError` if a new recorder cannot read the stored
    /// sequence.
    pub async fn acquire(
        &self,
        conversation_id: &str,
    ) -> Result<Arc<EventRecorder>, ObserveError> {
        let mut entries = self.entries.lock().await;
        entries.retain(|id, entry| {
            id == conversation_id
                || entry.recorder.strong_count() > 0
                || !entry.writer.is_finished()
        });

        if let Some(entry) = entries.remove(conversation_id) {
            if let Some(recorder) = entry.recorder.upgrade() {
                entries.insert(conversation_id.to_string(), entry);
                return Ok(recorder);
            }
            if let Err(e) = entry.writer.await {
                tracing::warn!(conversation_id, "previous event writer ended abnormally: {}", e);
            }
        }

        let (recorder, writer) =
            EventRecorder::start(self.pool.clone(), conversation_id, self.live_tx.clone()).await?;
        let recorder = Arc::new(recorder);
        entries.insert(
            conversation_id.to_string(),
            RegistryEntry {
                recorder: Arc::downgrade(&recorder),
                writer,
            },
        );
        Ok(recorder)
    }

    /// Conversations that currently have a live recorder.
    pub async fn live_conversations(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.recorder.strong_count() > 0)
            .count()
    }
}
