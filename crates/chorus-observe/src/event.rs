//! The conversation event record and the event types the bridge originates.

use chorus_types::SourceTag;
use serde::{Deserialize, Serialize};

/// One immutable entry in a conversation's timeline.
///
/// `seq` is the arrival index assigned by the recorder. It is the only
/// ordering key: timestamps are informational and may tie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    /// The conversation this event belongs to.
    pub conversation_id: String,
    /// Arrival index within the conversation, starting at 1.
    pub seq: i64,
    /// Which channel (or the bridge itself) produced the event.
    pub source: SourceTag,
    /// Event type. Channel messages keep their wire `type`; bridge events use
    /// the constants in [`event_types`].
    pub event_type: String,
    /// Arbitrary JSON payload.
    pub payload: serde_json::Value,
    /// RFC 3339 timestamp with millisecond precision.
    pub occurred_at: String,
}

/// Event types recorded by the bridge itself (as opposed to relayed wire
/// messages, which keep the `type` they arrived with).
pub mod event_types {
    pub const SESSION_STARTED: &str = "session_started";
    pub const SESSION_ENDED: &str = "session_ended";
    pub const CHANNEL_STATE: &str = "channel_state";
    pub const TURN_COMMITTED: &str = "turn_committed";
    pub const TURN_DISCARDED: &str = "turn_discarded";
    pub const TURN_UNDELIVERED: &str = "turn_undelivered";
    pub const TURN_CONFIGURED: &str = "turn_configured";
    pub const TOOL_DISPATCHED: &str = "tool_dispatched";
    pub const TOOL_DISPATCH_FAILED: &str = "tool_dispatch_failed";
    pub const AUTOPAUSE_IGNORED: &str = "ignored_automatic_pause";
    pub const TEAM_CHANNEL_RESET: &str = "team_channel_reset";
    pub const NARRATION_SENT: &str = "narration_sent";
    pub const AUDIO_FORMAT_CHANGED: &str = "audio_format_changed";
}
