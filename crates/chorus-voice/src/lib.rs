//! Audio plumbing for the Chorus voice bridge.
//!
//! The browser and the hosted speech model disagree about audio: the
//! browser captures at its device rate (often 48 kHz, sometimes stereo) and
//! the model wants mono 16-bit PCM at its own rate in 20 ms frames. This
//! crate owns everything between the two sockets:
//!
//! - [`audio`]: format normalization (down-mix, resample, gain) and
//!   re-framing through [`AudioFormatBridge`].
//! - [`turn`]: the [`TurnController`] state machine that decides when a
//!   block of user audio is a complete turn.
//! - [`capture`]: optional WAV capture of raw input for offline debugging.
//! - [`config`]: the voice knobs a deployment tunes per venue.

pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod turn;

pub use audio::{AudioFormat, AudioFormatBridge, AudioFrame, FRAME_DURATION_MS};
pub use capture::RawCapture;
pub use config::{NarrationPolicy, VoiceConfig};
pub use error::VoiceError;
pub use turn::{
    CompletedTurn, TurnController, TurnDetectionConfig, TurnEndReason, TurnEvent, TurnState,
};
