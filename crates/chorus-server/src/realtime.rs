//! The speech model's realtime protocol: session configuration, the
//! server events the bridge acts on, and the client events it sends.

use std::collections::{HashMap, HashSet};

use chorus_types::{ToolName, TurnMode};
use chorus_voice::audio::encode_base64_pcm;
use chorus_voice::TurnDetectionConfig;
use serde_json::{json, Value};

use crate::config::SpeechModelConfig;
use crate::dispatch::ToolCallRequest;

/// Builds the `session.update` sent once the model channel opens and again
/// whenever turn detection is reconfigured.
pub fn session_update(
    model: &SpeechModelConfig,
    mode: TurnMode,
    detection: &TurnDetectionConfig,
) -> Value {
    let turn_detection = match mode {
        TurnMode::Automatic => json!({
            "type": "server_vad",
            "threshold": detection.threshold,
            "prefix_padding_ms": detection.prefix_padding_ms,
            "silence_duration_ms": detection.silence_duration_ms,
        }),
        TurnMode::Manual => Value::Null,
    };

    json!({
        "type": "session.update",
        "session": {
            "modalities": ["audio", "text"],
            "instructions": model.instructions,
            "voice": model.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": { "model": model.transcription_model },
            "turn_detection": turn_detection,
            "tools": tool_definitions(),
            "tool_choice": "auto",
        },
    })
}

/// Function schemas for the fixed tool set.
pub fn tool_definitions() -> Value {
    let text_param = |what: &str| {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": what }
            },
            "required": ["text"],
        })
    };
    let no_params = json!({ "type": "object", "properties": {} });

    let tools: Vec<Value> = ToolName::ALL
        .into_iter()
        .map(|tool| {
            let (description, parameters) = match tool {
                ToolName::DelegateToTeam => (
                    "Hand a task to the agent team. Use for research, planning and anything multi-step.",
                    text_param("The task, in the user's words."),
                ),
                ToolName::DelegateToCoder => (
                    "Hand a programming task to the coding agent.",
                    text_param("The coding task, in the user's words."),
                ),
                ToolName::Pause => (
                    "Stop the agent team's current task. Only when the user asks.",
                    no_params.clone(),
                ),
                ToolName::Reset => (
                    "Start over with a fresh agent team. Does not start a task.",
                    no_params.clone(),
                ),
                ToolName::PauseCoder => (
                    "Stop the coding agent's current task. Only when the user asks.",
                    no_params.clone(),
                ),
            };
            json!({
                "type": "function",
                "name": tool.as_str(),
                "description": description,
                "parameters": parameters,
            })
        })
        .collect();
    Value::Array(tools)
}

pub fn input_audio_append(samples: &[i16]) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": encode_base64_pcm(samples),
    })
}

pub fn input_audio_commit() -> Value {
    json!({ "type": "input_audio_buffer.commit" })
}

pub fn response_create() -> Value {
    json!({ "type": "response.create" })
}

/// Out-of-band context for the assistant to speak about.
pub fn system_notice(text: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "system",
            "content": [{ "type": "input_text", "text": text }],
        },
    })
}

pub fn function_call_output(call_id: &str, output: &Value) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output.to_string(),
        },
    })
}

/// The server events the bridge acts on. Everything else is `Other`.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    SessionCreated,
    SessionUpdated,
    /// Base64 PCM at the model's sample rate.
    AudioDelta { audio: String },
    TranscriptDelta { delta: String },
    InputTranscript { transcript: String },
    ConversationItemCreated,
    SpeechStarted,
    SpeechStopped,
    FunctionCallAdded { call_id: String, name: String },
    FunctionCallArgumentsDelta { call_id: String, delta: String },
    FunctionCallArgumentsDone {
        call_id: String,
        name: Option<String>,
        arguments: String,
    },
    ResponseDone,
    Error { message: String },
    Other,
}

/// Parses one server event. Returns the raw `type` alongside the event.
pub fn parse_model_event(text: &str) -> Result<(String, ModelEvent, Value), serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let str_field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let event = match event_type.as_str() {
        "session.created" => ModelEvent::SessionCreated,
        "session.updated" => ModelEvent::SessionUpdated,
        "response.audio.delta" | "response.output_audio.delta" => ModelEvent::AudioDelta {
            audio: str_field("delta"),
        },
        "response.audio_transcript.delta" | "response.output_audio_transcript.delta" => {
            ModelEvent::TranscriptDelta {
                delta: str_field("delta"),
            }
        }
        "conversation.item.input_audio_transcription.completed" => ModelEvent::InputTranscript {
            transcript: str_field("transcript"),
        },
        "conversation.item.created" => ModelEvent::ConversationItemCreated,
        "input_audio_buffer.speech_started" => ModelEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => ModelEvent::SpeechStopped,
        "response.output_item.added" => {
            let item = value.get("item");
            let item_str = |key: &str| {
                item.and_then(|i| i.get(key))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            if item_str("type") == "function_call" {
                ModelEvent::FunctionCallAdded {
                    call_id: item_str("call_id"),
                    name: item_str("name"),
                }
            } else {
                ModelEvent::Other
            }
        }
        "response.function_call_arguments.delta" => ModelEvent::FunctionCallArgumentsDelta {
            call_id: str_field("call_id"),
            delta: str_field("delta"),
        },
        "response.function_call_arguments.done" => ModelEvent::FunctionCallArgumentsDone {
            call_id: str_field("call_id"),
            name: value.get("name").and_then(Value::as_str).map(str::to_string),
            arguments: str_field("arguments"),
        },
        "response.done" => ModelEvent::ResponseDone,
        "error" => ModelEvent::Error {
            message: value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        },
        _ => ModelEvent::Other,
    };
    Ok((event_type, event, value))
}

#[derive(Debug, Default)]
struct PendingCall {
    name: String,
    arguments: String,
}

/// Assembles streamed function-call events into one [`ToolCallRequest`]
/// per call id. A call id is surfaced at most once.
#[derive(Debug, Default)]
pub struct FunctionCallAssembler {
    pending: HashMap<String, PendingCall>,
    finished: HashSet<String>,
}

impl FunctionCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added(&mut self, call_id: &str, name: &str) {
        if self.finished.contains(call_id) {
            return;
        }
        self.pending.entry(call_id.to_string()).or_default().name = name.to_string();
    }

    pub fn delta(&mut self, call_id: &str, delta: &str) {
        if self.finished.contains(call_id) {
            return;
        }
        self.pending
            .entry(call_id.to_string())
            .or_default()
            .arguments
            .push_str(delta);
    }

    /// Completes a call. `arguments`, when non-empty, is authoritative over
    /// the accumulated deltas.
    pub fn done(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        arguments: &str,
    ) -> Option<ToolCallRequest> {
        if call_id.is_empty() || !self.finished.insert(call_id.to_string()) {
            return None;
        }
        let pending = self.pending.remove(call_id).unwrap_or_default();
        let name = name
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or(pending.name);
        let raw = if arguments.is_empty() {
            pending.arguments
        } else {
            arguments.to_string()
        };
        Some(ToolCallRequest::from_raw(call_id, name, &raw))
    }
}
