//! Persistence operations for the conversation event log.
//!
//! Writes go through [`insert_event`] with a sequence number already chosen
//! by the recorder. Reads go through [`query_events`], which filters by
//! source and event type and pages by sequence number.

use chorus_types::SourceTag;
use rusqlite::{params, Connection, Row};

use crate::error::ObserveError;
use crate::event::ConversationEvent;

/// Persists one event.
///
/// # Errors
///
/// Returns `ObserveError::Database` on SQL failure, including a duplicate
/// `(conversation_id, seq)` pair, or `ObserveError::Serialization` if the
/// payload cannot be encoded.
pub fn insert_event(conn: &Connection, event: &ConversationEvent) -> Result<(), ObserveError> {
    let payload_json = serde_json::to_string(&event.payload)?;
    conn.execute(
        "INSERT INTO conversation_events
            (conversation_id, seq, source, event_type, payload_json, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.conversation_id,
            event.seq,
            event.source.as_str(),
            event.event_type,
            payload_json,
            event.occurred_at,
        ],
    )?;
    Ok(())
}

/// Returns the next sequence number for the given conversation.
///
/// # Errors
///
/// Returns `ObserveError::Database` on SQL failure.
pub fn next_seq(conn: &Connection, conversation_id: &str) -> Result<i64, ObserveError> {
    let max_seq: Option<i64> = conn.query_row(
        "SELECT MAX(seq) FROM conversation_events WHERE conversation_id = ?1",
        params![conversation_id],
        |row| row.get(0),
    )?;
    Ok(max_seq.unwrap_or(0) + 1)
}

/// Filter criteria for querying a conversation's event log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events from this source.
    pub source: Option<SourceTag>,
    /// Only events of this type.
    pub event_type: Option<String>,
    /// Only events with `seq` strictly greater than this value.
    pub after_seq: Option<i64>,
    /// Maximum number of events to return. `None` returns everything.
    pub limit: Option<i64>,
}

/// Queries a conversation's events in arrival order (ascending `seq`).
///
/// # Errors
///
/// Returns `ObserveError::Database` on SQL failure or
/// `ObserveError::UnknownSource` if a stored row carries an unknown tag.
pub fn query_events(
    conn: &Connection,
    conversation_id: &str,
    filter: &EventFilter,
) -> Result<Vec<ConversationEvent>, ObserveError> {
    // Clauses and bind parameters are collected separately so nothing is
    // interpolated into the SQL text.
    let mut clauses = vec!["conversation_id = ?1".to_string()];
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> =
        vec![Box::new(conversation_id.to_string())];
    let mut idx = 2u32;

    if let Some(source) = filter.source {
        clauses.push(format!("source = ?{idx}"));
        param_values.push(Box::new(source.as_str()));
        idx += 1;
    }

    if let Some(ref et) = filter.event_type {
        clauses.push(format!("event_type = ?{idx}"));
        param_values.push(Box::new(et.clone()));
        idx += 1;
    }

    if let Some(after) = filter.after_seq {
        clauses.push(format!("seq > ?{idx}"));
        param_values.push(Box::new(after));
        idx += 1;
    }

    // SQLite treats a negative LIMIT as "no limit".
    param_values.push(Box::new(filter.limit.unwrap_or(-1)));

    let where_clause = clauses.join(" AND ");
    let sql = format!(
        "SELECT conversation_id, seq, source, event_type, payload_json, occurred_at
         FROM conversation_events
         WHERE {where_clause}
         ORDER BY seq ASC
         LIMIT ?{idx}"
    );

    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| &**p).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), raw_row)?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_event()?);
    }

    Ok(events)
}

/// Deletes every event of a conversation. Returns the number of rows removed.
///
/// # Errors
///
/// Returns `ObserveError::Database` on SQL failure.
pub fn delete_conversation_events(
    conn: &Connection,
    conversation_id: &str,
) -> Result<usize, ObserveError> {
    let removed = conn.execute(
        "DELETE FROM conversation_events WHERE conversation_id = ?1",
        params![conversation_id],
    )?;
    Ok(removed)
}

struct RawEvent {
    conversation_id: String,
    seq: i64,
    source: String,
    event_type: String,
    payload_json: String,
    occurred_at: String,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        conversation_id: row.get(0)?,
        seq: row.get(1)?,
        source: row.get(2)?,
        event_type: row.get(3)?,
        payload_json: row.get(4)?,
        occurred_at: row.get(5)?,
    })
}

impl RawEvent {
    fn into_event(self) -> Result<ConversationEvent, ObserveError> {
        let source = self
            .source
            .parse()
            .map_err(|_| ObserveError::UnknownSource(self.source.clone()))?;
        Ok(ConversationEvent {
            conversation_id: self.conversation_id,
            seq: self.seq,
            source,
            event_type: self.event_type,
            payload: serde_json::from_str(&self.payload_json)?,
            occurred_at: self.occurred_at,
        })
    }
}
