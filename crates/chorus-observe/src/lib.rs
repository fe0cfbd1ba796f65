//! Conversation event log for the Chorus voice bridge.
//!
//! Every message that crosses any channel of a live session (browser,
//! speech model, team, coding agent) and every decision the bridge makes
//! about it is recorded here as a [`ConversationEvent`]. Events are
//! append-only and ordered by a single per-conversation sequence number
//! that reflects the order the recorder observed them, so an export merges
//! voice, team, and coding-agent activity into one timeline.
//!
//! Live sessions write through an [`EventRecorder`], which never fails the
//! caller: persistence happens on a background writer task and failures are
//! logged. Sessions share one recorder per conversation through a
//! [`RecorderRegistry`]. Queries and exports go through [`query_events`].
//!
//! ```rust,ignore
//! use chorus_observe::RecorderRegistry;
//! use chorus_types::SourceTag;
//!
//! let registry = RecorderRegistry::new(pool, live_tx);
//! let recorder = registry.acquire("conv-1").await?;
//! recorder.record(SourceTag::Team, "task_progress", json!({"step": 2}));
//! ```

mod error;
mod event;
mod recorder;
mod store;

pub use error::ObserveError;
pub use event::{event_types, ConversationEvent};
pub use recorder::{EventRecorder, RecorderRegistry};
pub use store::{delete_conversation_events, insert_event, next_seq, query_events, EventFilter};
