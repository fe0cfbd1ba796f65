//! Shared types for the Chorus voice session bridge.
//!
//! This crate holds the small vocabulary every other crate agrees on: which
//! channel a message came from, the legal lifecycle of a channel, the turn
//! detection modes, and the fixed set of tools the speech model may invoke.
//! It has no runtime dependencies beyond `serde`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when parsing one of the string-labelled enums in this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseLabelError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

/// Source tag attached to every recorded conversation event.
///
/// The set is fixed: one tag per class of channel the bridge talks to, plus
/// `System` for events the bridge itself originates (dispatch bookkeeping,
/// lifecycle notices).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    /// The browser client (control messages, manual commits).
    Browser,
    /// The hosted speech model.
    Voice,
    /// The nested multi-agent team channel.
    Team,
    /// The coding-agent channel.
    Coder,
    /// The bridge itself.
    System,
}

impl SourceTag {
    /// Returns the canonical string label for this tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Voice => "voice",
            Self::Team => "team",
            Self::Coder => "coder",
            Self::System => "system",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "browser" => Ok(Self::Browser),
            "voice" => Ok(Self::Voice),
            "team" => Ok(Self::Team),
            "coder" => Ok(Self::Coder),
            "system" => Ok(Self::System),
            _ => Err(ParseLabelError {
                kind: "source tag",
                value: s.to_string(),
            }),
        }
    }
}

/// The channels a session supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Browser audio + control WebSocket.
    Browser,
    /// Hosted speech model. Loss of this channel ends the session.
    SpeechModel,
    /// Nested multi-agent team execution channel.
    Team,
    /// Coding-agent execution channel.
    Coder,
}

impl ChannelKind {
    /// All channel kinds, in teardown order.
    pub const ALL: [ChannelKind; 4] = [Self::Team, Self::Coder, Self::SpeechModel, Self::Browser];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::SpeechModel => "speech_model",
            Self::Team => "team",
            Self::Coder => "coder",
        }
    }

    /// The tag under which messages from this channel are recorded.
    pub fn source_tag(self) -> SourceTag {
        match self {
            Self::Browser => SourceTag::Browser,
            Self::SpeechModel => SourceTag::Voice,
            Self::Team => SourceTag::Team,
            Self::Coder => SourceTag::Coder,
        }
    }

    /// Whether this channel anchors the session.
    pub fn is_anchor(self) -> bool {
        matches!(self, Self::SpeechModel)
    }

    /// Whether this is a downstream execution channel (team or coder).
    pub fn is_downstream(self) -> bool {
        matches!(self, Self::Team | Self::Coder)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single supervised channel.
///
/// ```text
/// disconnected -> connecting -> open -> closing -> disconnected
///                     |          |
///                     +--> error <+--> disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Error,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Error => "error",
        }
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Open)
                | (Connecting, Error)
                | (Open, Closing)
                | (Open, Error)
                | (Closing, Disconnected)
                | (Closing, Error)
                | (Error, Disconnected)
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turn detection mode, selected per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    /// Voice-activity detection decides when a turn ends.
    #[default]
    Automatic,
    /// A turn ends only on an explicit commit.
    Manual,
}

impl FromStr for TurnMode {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" | "server_vad" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            _ => Err(ParseLabelError {
                kind: "turn mode",
                value: s.to_string(),
            }),
        }
    }
}

/// The fixed set of tools the speech model may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    /// Forward a free-text task to the team channel.
    DelegateToTeam,
    /// Forward a free-text task to the coding-agent channel.
    DelegateToCoder,
    /// Cancel the team's current run.
    Pause,
    /// Recreate the team channel without starting a task.
    Reset,
    /// Cancel the coding agent's current run.
    PauseCoder,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        Self::DelegateToTeam,
        Self::DelegateToCoder,
        Self::Pause,
        Self::Reset,
        Self::PauseCoder,
    ];

    /// The function name advertised to the speech model.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DelegateToTeam => "delegate_to_team",
            Self::DelegateToCoder => "delegate_to_coder",
            Self::Pause => "pause",
            Self::Reset => "reset",
            Self::PauseCoder => "pause_coder",
        }
    }

    /// The downstream channel this tool acts on.
    pub fn target(self) -> ChannelKind {
        match self {
            Self::DelegateToTeam | Self::Pause | Self::Reset => ChannelKind::Team,
            Self::DelegateToCoder | Self::PauseCoder => ChannelKind::Coder,
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| ParseLabelError {
                kind: "tool",
                value: s.to_string(),
            })
    }
}
