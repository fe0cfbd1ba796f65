//! One live voice session.
//!
//! The session owns its channels, turn controller, dispatcher and audio
//! bridges, and handles every inbound message from every channel in one
//! loop. Nothing here is shared with another session.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chorus_observe::{event_types, EventRecorder, ObserveError};
use chorus_types::{ChannelKind, SourceTag, TurnMode};
use chorus_voice::audio::{decode_base64_pcm, pcm_from_le_bytes};
use chorus_voice::{
    AudioFormat, AudioFormatBridge, AudioFrame, CompletedTurn, NarrationPolicy, RawCapture,
    TurnController, TurnEvent, VoiceError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::{
    ChannelError, ChannelFrame, ChannelLink, ChannelSupervisor, Inbound, InboundPayload,
};
use crate::dispatch::{ToolCallRequest, ToolDispatchExecutor};
use crate::realtime::{self, FunctionCallAssembler, ModelEvent};
use crate::AppState;

/// Frames per `input_audio_buffer.append` when flushing a turn (one second).
const FRAMES_PER_APPEND: usize = 50;

/// Longest downstream summary handed to the assistant for narration.
const NARRATION_MAX_CHARS: usize = 600;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("event recorder unavailable: {0}")]
    Recorder(#[from] ObserveError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("audio setup failed: {0}")]
    Audio(#[from] VoiceError),
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: String,
    pub conversation_id: String,
    pub turn_mode: TurnMode,
}

/// Control messages the browser may send as text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum BrowserControl {
    /// Manual turn completion.
    #[serde(rename = "input_audio_buffer.commit")]
    Commit,
    #[serde(rename = "audio.configure")]
    AudioConfigure {
        model_sample_rate: Option<u32>,
        browser_sample_rate: Option<u32>,
        browser_channels: Option<u16>,
        gain: Option<f32>,
    },
    #[serde(rename = "turn.configure")]
    TurnConfigure {
        mode: Option<TurnMode>,
        threshold: Option<f32>,
        prefix_padding_ms: Option<u32>,
        silence_duration_ms: Option<u32>,
    },
    #[serde(rename = "session.stop")]
    Stop,
}

/// Runs a session to completion over an already-open browser link.
///
/// Returns once the session has ended and everything it recorded is
/// persisted. Fails only if the session could not be set up at all.
pub async fn run_session(
    state: Arc<AppState>,
    browser: ChannelLink,
    params: SessionParams,
) -> Result<(), SessionError> {
    let recorder = state.recorders.acquire(&params.conversation_id).await?;
    let _registration = state.register_session(&params.session_id, &params.conversation_id);

    let result = match Session::new(&state, recorder.clone(), &params) {
        Ok((mut session, inbound)) => {
            let reason = session.run(browser, inbound).await;
            session.shutdown(&reason);
            Ok(())
        }
        Err(e) => Err(e),
    };

    recorder.flush().await;
    result
}

struct Session {
    state: Arc<AppState>,
    params: SessionParams,
    recorder: Arc<EventRecorder>,
    channels: ChannelSupervisor,
    dispatcher: ToolDispatchExecutor,
    turns: TurnController,
    input: AudioFormatBridge,
    output: AudioFormatBridge,
    capture: Option<RawCapture>,
    calls: FunctionCallAssembler,
    narration: NarrationPolicy,
    /// A tool call was answered during the current model response.
    tool_outputs_pending: bool,
}

impl Session {
    fn new(
        state: &Arc<AppState>,
        recorder: Arc<EventRecorder>,
        params: &SessionParams,
    ) -> Result<(Self, mpsc::Receiver<Inbound>), SessionError> {
        let voice = &state.config.voice;
        let browser = voice.browser_format();
        let model = voice.model_format();
        let input = AudioFormatBridge::new(browser, model, voice.input_gain)?;
        let playback = AudioFormat::pcm16(browser.sample_rate, 1);
        let output = AudioFormatBridge::new(model, playback, 1.0)?;

        let (channels, inbound) = ChannelSupervisor::new(
            params.session_id.clone(),
            state.connector.clone(),
            recorder.clone(),
        );
        let dispatcher = ToolDispatchExecutor::new(
            recorder.clone(),
            Duration::from_millis(voice.autopause_window_ms),
        );

        let capture = if voice.debug_capture {
            match RawCapture::create(
                &voice.debug_capture_dir,
                &params.session_id,
                &params.conversation_id,
                browser,
            ) {
                Ok(capture) => Some(capture),
                Err(e) => {
                    tracing::warn!(
                        session_id = %params.session_id,
                        error = %e,
                        "debug audio capture disabled"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok((
            Self {
                state: state.clone(),
                params: params.clone(),
                recorder,
                channels,
                dispatcher,
                turns: TurnController::new(params.turn_mode, voice.turn_detection()),
                input,
                output,
                capture,
                calls: FunctionCallAssembler::new(),
                narration: voice.narration,
                tool_outputs_pending: false,
            },
            inbound,
        ))
    }

    /// Opens the channels and handles traffic until the session ends.
    /// Returns why it ended.
    async fn run(
        &mut self,
        browser: ChannelLink,
        mut inbound: mpsc::Receiver<Inbound>,
    ) -> String {
        if let Err(e) = self.channels.attach(ChannelKind::Browser, browser) {
            return format!("browser attach failed: {e}");
        }

        if let Err(e) = self.channels.connect(ChannelKind::SpeechModel).await {
            self.send_browser_json(&json!({
                "type": "error",
                "message": "voice service unavailable",
            }))
            .await;
            return format!("speech model connect failed: {e}");
        }
        let update = realtime::session_update(
            &self.state.config.speech_model,
            self.turns.mode(),
            self.turns.config(),
        );
        self.send_model(&update).await;

        for kind in [ChannelKind::Team, ChannelKind::Coder] {
            // Non-fatal: dispatch reports the channel as unavailable.
            let _ = self.channels.connect(kind).await;
        }

        tracing::info!(
            session_id = %self.params.session_id,
            conversation_id = %self.params.conversation_id,
            turn_mode = ?self.turns.mode(),
            "voice session started"
        );
        self.recorder.record(
            SourceTag::System,
            event_types::SESSION_STARTED,
            json!({
                "session_id": self.params.session_id,
                "turn_mode": self.turns.mode(),
                "browser_format": self.input.source(),
                "model_format": self.input.target(),
                "input_gain": self.input.gain(),
            }),
        );
        self.send_browser_json(&json!({
            "type": "session.ready",
            "session_id": self.params.session_id,
            "conversation_id": self.params.conversation_id,
        }))
        .await;

        while let Some(message) = inbound.recv().await {
            if !self.channels.is_current(&message) {
                tracing::debug!(
                    channel = message.kind.as_str(),
                    "ignoring message from replaced connection"
                );
                continue;
            }
            if let ControlFlow::Break(reason) = self.handle(message).await {
                return reason;
            }
        }
        "inbound queue closed".to_string()
    }

    async fn handle(&mut self, message: Inbound) -> ControlFlow<String> {
        let kind = message.kind;
        match message.payload {
            InboundPayload::Closed => self.on_channel_closed(kind).await,
            InboundPayload::Frame(frame) => match (kind, frame) {
                (ChannelKind::Browser, ChannelFrame::Binary(bytes)) => {
                    self.on_browser_audio(&bytes).await;
                    ControlFlow::Continue(())
                }
                (ChannelKind::Browser, ChannelFrame::Text(text)) => {
                    self.on_browser_text(&text).await
                }
                (ChannelKind::SpeechModel, ChannelFrame::Text(text)) => {
                    self.on_model_text(text).await;
                    ControlFlow::Continue(())
                }
                (ChannelKind::Team | ChannelKind::Coder, ChannelFrame::Text(text)) => {
                    self.on_downstream(kind, &text).await;
                    ControlFlow::Continue(())
                }
                (_, ChannelFrame::Binary(bytes)) => {
                    tracing::debug!(
                        channel = kind.as_str(),
                        len = bytes.len(),
                        "ignoring binary frame"
                    );
                    ControlFlow::Continue(())
                }
            },
        }
    }

    async fn on_channel_closed(&mut self, kind: ChannelKind) -> ControlFlow<String> {
        self.channels.mark_failed(kind);
        match kind {
            ChannelKind::SpeechModel => {
                self.send_browser_json(&json!({
                    "type": "error",
                    "message": "voice service disconnected",
                }))
                .await;
                ControlFlow::Break("speech model disconnected".to_string())
            }
            ChannelKind::Browser => ControlFlow::Break("browser disconnected".to_string()),
            ChannelKind::Team | ChannelKind::Coder => {
                let who = if kind == ChannelKind::Team {
                    "agent team"
                } else {
                    "coding agent"
                };
                self.notify_model(&format!(
                    "The connection to the {who} was lost. Tell the user; a reset will reconnect the team."
                ))
                .await;
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_browser_audio(&mut self, bytes: &[u8]) {
        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.write(&pcm_from_le_bytes(bytes)) {
                tracing::warn!(
                    session_id = %self.params.session_id,
                    error = %e,
                    "debug audio capture stopped"
                );
                self.capture = None;
            }
        }
        let frames = self.input.push_pcm_bytes(bytes);
        for frame in frames {
            self.on_model_frame(frame).await;
        }
    }

    async fn on_model_frame(&mut self, frame: AudioFrame) {
        match self.turns.push_frame(frame) {
            Some(TurnEvent::SpeechStarted) => {
                tracing::debug!(session_id = %self.params.session_id, "speech started");
                self.send_browser_json(&json!({ "type": "turn.speech_started" })).await;
            }
            Some(TurnEvent::TurnComplete(turn)) => self.flush_turn(turn).await,
            None => {}
        }
    }

    /// Sends a completed turn to the speech model.
    ///
    /// Each message waits for room on the model connection, so a long turn
    /// is paced rather than cut short. A turn that still cannot be delivered
    /// is recorded and reported to the browser.
    async fn flush_turn(&mut self, turn: CompletedTurn) {
        let duration_ms = turn.duration_ms();
        let mut messages: Vec<Value> = turn
            .frames
            .chunks(FRAMES_PER_APPEND)
            .map(|chunk| {
                let samples: Vec<i16> = chunk
                    .iter()
                    .flat_map(|f| f.samples.iter().copied())
                    .collect();
                realtime::input_audio_append(&samples)
            })
            .collect();
        if self.turns.mode() == TurnMode::Manual {
            messages.push(realtime::input_audio_commit());
            messages.push(realtime::response_create());
        }

        let total = messages.len();
        for (sent, message) in messages.iter().enumerate() {
            let Err(e) = self.channels.deliver_json(ChannelKind::SpeechModel, message).await else {
                continue;
            };
            tracing::error!(
                session_id = %self.params.session_id,
                error = %e,
                sent,
                total,
                duration_ms,
                "turn could not be delivered to the speech model"
            );
            self.recorder.record(
                SourceTag::System,
                event_types::TURN_UNDELIVERED,
                json!({
                    "reason": turn.reason,
                    "duration_ms": duration_ms,
                    "frames": turn.frames.len(),
                    "messages_sent": sent,
                    "messages_total": total,
                    "error": e.to_string(),
                }),
            );
            self.send_browser_json(&json!({
                "type": "error",
                "message": "your last turn could not be delivered to the voice service",
            }))
            .await;
            return;
        }

        self.recorder.record(
            SourceTag::System,
            event_types::TURN_COMMITTED,
            json!({
                "reason": turn.reason,
                "duration_ms": duration_ms,
                "frames": turn.frames.len(),
            }),
        );
        self.send_browser_json(&json!({
            "type": "turn.committed",
            "duration_ms": duration_ms,
        }))
        .await;
    }

    async fn on_browser_text(&mut self, text: &str) -> ControlFlow<String> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => json!({ "text": text }),
        };
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_string();
        self.recorder
            .record(SourceTag::Browser, event_type.clone(), value.clone());

        let control = match serde_json::from_value::<BrowserControl>(value) {
            Ok(control) => control,
            Err(_) => {
                tracing::debug!(event_type = %event_type, "unhandled browser message");
                return ControlFlow::Continue(());
            }
        };

        match control {
            BrowserControl::Commit => match self.turns.commit() {
                Some(TurnEvent::TurnComplete(turn)) => self.flush_turn(turn).await,
                _ => tracing::debug!(
                    session_id = %self.params.session_id,
                    "commit with empty buffer"
                ),
            },
            BrowserControl::AudioConfigure {
                model_sample_rate,
                browser_sample_rate,
                browser_channels,
                gain,
            } => {
                self.configure_audio(
                    model_sample_rate,
                    browser_sample_rate,
                    browser_channels,
                    gain,
                )
                .await
            }
            BrowserControl::TurnConfigure {
                mode,
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
            } => {
                let mut detection = *self.turns.config();
                if let Some(t) = threshold.filter(|t| (0.0..=1.0).contains(t)) {
                    detection.threshold = t;
                }
                if let Some(p) = prefix_padding_ms {
                    detection.prefix_padding_ms = p;
                }
                if let Some(s) = silence_duration_ms.filter(|s| *s > 0) {
                    detection.silence_duration_ms = s;
                }
                self.turns.set_config(detection);
                if let Some(mode) = mode {
                    self.turns.set_mode(mode);
                }
                let update = realtime::session_update(
                    &self.state.config.speech_model,
                    self.turns.mode(),
                    self.turns.config(),
                );
                self.send_model(&update).await;
                self.recorder.record(
                    SourceTag::System,
                    event_types::TURN_CONFIGURED,
                    json!({ "mode": self.turns.mode(), "detection": detection }),
                );
            }
            BrowserControl::Stop => return ControlFlow::Break("stopped by browser".to_string()),
        }
        ControlFlow::Continue(())
    }

    async fn configure_audio(
        &mut self,
        model_sample_rate: Option<u32>,
        browser_sample_rate: Option<u32>,
        browser_channels: Option<u16>,
        gain: Option<f32>,
    ) {
        let mut applied = || -> Result<(), VoiceError> {
            if let Some(rate) = model_sample_rate {
                self.input.set_target_rate(rate)?;
                self.output.set_source(AudioFormat::pcm16(rate, 1))?;
            }
            if browser_sample_rate.is_some() || browser_channels.is_some() {
                let current = self.input.source();
                let source = AudioFormat::pcm16(
                    browser_sample_rate.unwrap_or(current.sample_rate),
                    browser_channels.unwrap_or(current.channels),
                );
                self.input.set_source(source)?;
                self.output.set_target_rate(source.sample_rate)?;
            }
            if let Some(gain) = gain {
                self.input.set_gain(gain)?;
            }
            Ok(())
        };
        match applied() {
            Ok(()) => {
                self.recorder.record(
                    SourceTag::System,
                    event_types::AUDIO_FORMAT_CHANGED,
                    json!({
                        "browser_format": self.input.source(),
                        "model_format": self.input.target(),
                        "input_gain": self.input.gain(),
                    }),
                );
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %self.params.session_id,
                    error = %e,
                    "rejected audio reconfiguration"
                );
                self.send_browser_json(&json!({ "type": "error", "message": e.to_string() }))
                    .await;
            }
        }
    }

    async fn on_model_text(&mut self, text: String) {
        let (event_type, event, value) = match realtime::parse_model_event(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.params.session_id,
                    error = %e,
                    "unparseable speech model message"
                );
                self.recorder
                    .record(SourceTag::Voice, "unparseable", json!({ "raw": text }));
                return;
            }
        };

        // Audio is transient and never recorded.
        if let ModelEvent::AudioDelta { audio } = &event {
            self.play(audio).await;
            return;
        }
        self.recorder.record(SourceTag::Voice, event_type, value);
        self.send_browser(ChannelFrame::Text(text)).await;

        match event {
            ModelEvent::FunctionCallAdded { call_id, name } => self.calls.added(&call_id, &name),
            ModelEvent::FunctionCallArgumentsDelta { call_id, delta } => {
                self.calls.delta(&call_id, &delta)
            }
            ModelEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                if let Some(request) = self.calls.done(&call_id, name.as_deref(), &arguments) {
                    self.run_tool_call(request).await;
                }
            }
            ModelEvent::ResponseDone => {
                if let Some(frame) = self.output.flush() {
                    self.send_browser(ChannelFrame::Binary(frame.to_le_bytes())).await;
                }
                if std::mem::take(&mut self.tool_outputs_pending) {
                    self.send_model(&realtime::response_create()).await;
                }
            }
            ModelEvent::Error { message } => {
                tracing::warn!(
                    session_id = %self.params.session_id,
                    message = %message,
                    "speech model reported an error"
                );
            }
            _ => {}
        }
    }

    /// Dispatches one tool call and returns its outcome to the model. The
    /// outcome is awaited before the next inbound message is handled.
    async fn run_tool_call(&mut self, request: ToolCallRequest) {
        let outcome = self.dispatcher.dispatch(&request, &mut self.channels).await;
        let output = outcome.to_value();
        self.send_model(&realtime::function_call_output(&request.call_id, &output)).await;
        self.tool_outputs_pending = true;
        self.send_browser_json(&json!({
            "type": "tool.result",
            "call_id": request.call_id,
            "tool": request.name,
            "outcome": output,
        }))
        .await;
    }

    async fn play(&mut self, audio: &str) {
        let samples = match decode_base64_pcm(audio) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.params.session_id,
                    error = %e,
                    "dropping model audio"
                );
                return;
            }
        };
        let frame = AudioFrame::new(samples, self.output.source());
        let frames = self.output.push(&frame);
        for out in frames {
            self.send_browser(ChannelFrame::Binary(out.to_le_bytes())).await;
        }
    }

    async fn on_downstream(&mut self, kind: ChannelKind, text: &str) {
        let payload: Value = serde_json::from_str(text).unwrap_or_else(|_| json!({ "text": text }));
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_string();
        self.recorder
            .record(kind.source_tag(), event_type.clone(), payload.clone());
        self.send_browser_json(&json!({
            "type": "channel.event",
            "channel": kind.as_str(),
            "event": payload,
        }))
        .await;

        if let Some(narration) = self.narration_for(kind, &event_type, &payload) {
            self.notify_model(&narration).await;
            self.recorder.record(
                SourceTag::System,
                event_types::NARRATION_SENT,
                json!({ "channel": kind.as_str(), "text": narration }),
            );
        }
    }

    /// Decides whether a downstream message should be spoken about.
    fn narration_for(
        &mut self,
        kind: ChannelKind,
        event_type: &str,
        payload: &Value,
    ) -> Option<String> {
        if self.narration == NarrationPolicy::Never {
            return None;
        }
        let completed = is_completion(event_type, payload);
        let summary = summarize(payload);
        let flags = self.dispatcher.flags_mut();
        match (kind, completed) {
            (ChannelKind::Team, true) if !flags.run_completed => {
                flags.run_completed = true;
                Some(format!(
                    "The agent team finished its task. Briefly tell the user the outcome: {summary}"
                ))
            }
            (ChannelKind::Team, false)
                if self.narration == NarrationPolicy::MidRunOnce
                    && !flags.narrated_mid_run
                    && !flags.run_completed =>
            {
                flags.narrated_mid_run = true;
                Some(format!(
                    "The agent team is still working. Give the user a one-sentence progress update: {summary}"
                ))
            }
            (ChannelKind::Coder, true) => Some(format!(
                "The coding agent finished. Briefly tell the user the outcome: {summary}"
            )),
            _ => None,
        }
    }

    async fn notify_model(&mut self, text: &str) {
        self.send_model(&realtime::system_notice(text)).await;
        self.send_model(&realtime::response_create()).await;
    }

    async fn send_model(&mut self, message: &Value) {
        if let Err(e) = self.channels.deliver_json(ChannelKind::SpeechModel, message).await {
            tracing::warn!(
                session_id = %self.params.session_id,
                error = %e,
                "speech model send failed"
            );
        }
    }

    async fn send_browser_json(&mut self, message: &Value) {
        self.send_browser(ChannelFrame::Text(message.to_string())).await;
    }

    /// Audio to the browser is dropped when its queue is full; everything
    /// else waits for room.
    async fn send_browser(&mut self, frame: ChannelFrame) {
        let result = match frame {
            ChannelFrame::Binary(_) => self.channels.send(ChannelKind::Browser, frame),
            ChannelFrame::Text(_) => self.channels.deliver(ChannelKind::Browser, frame).await,
        };
        match result {
            Ok(()) => {}
            Err(ChannelError::Saturated(_)) => {
                tracing::debug!(
                    session_id = %self.params.session_id,
                    "browser queue full; frame dropped"
                );
            }
            Err(e) => {
                tracing::debug!(
                    session_id = %self.params.session_id,
                    error = %e,
                    "browser send failed"
                );
            }
        }
    }

    /// Tears everything down. Safe whatever state the session reached.
    fn shutdown(&mut self, reason: &str) {
        let partial = self.turns.take_buffered();
        if !partial.is_empty() {
            let duration_ms: u32 = partial.iter().map(AudioFrame::duration_ms).sum();
            tracing::info!(
                session_id = %self.params.session_id,
                duration_ms,
                "discarding uncommitted audio at session end"
            );
            self.recorder.record(
                SourceTag::System,
                event_types::TURN_DISCARDED,
                json!({ "duration_ms": duration_ms, "frames": partial.len() }),
            );
        }
        if let Some(capture) = self.capture.take() {
            match capture.finalize() {
                Ok(path) => tracing::info!(path = %path.display(), "debug audio written"),
                Err(e) => tracing::warn!(error = %e, "failed to finalize debug audio"),
            }
        }

        self.channels.teardown();
        tracing::info!(
            session_id = %self.params.session_id,
            conversation_id = %self.params.conversation_id,
            reason,
            "voice session ended"
        );
        self.recorder.record(
            SourceTag::System,
            event_types::SESSION_ENDED,
            json!({ "session_id": self.params.session_id, "reason": reason }),
        );
    }
}

fn is_completion(event_type: &str, payload: &Value) -> bool {
    const COMPLETION_TYPES: [&str; 6] = [
        "result",
        "task_complete",
        "task_completed",
        "run_complete",
        "completed",
        "done",
    ];
    if COMPLETION_TYPES.contains(&event_type) {
        return true;
    }
    matches!(
        payload.get("status").and_then(Value::as_str),
        Some("completed" | "complete" | "done")
    )
}

fn summarize(payload: &Value) -> String {
    let text = ["data", "content", "message", "text", "result", "summary"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string());
    if text.chars().count() > NARRATION_MAX_CHARS {
        let mut cut: String = text.chars().take(NARRATION_MAX_CHARS).collect();
        cut.push_str("...");
        cut
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{link_pair, MemoryConnector, RemoteEnd};
    use crate::channel::CHANNEL_QUEUE_CAPACITY;
    use crate::config::Config;
    use crate::test_support::TestDb;
    use chorus_observe::ConversationEvent;
    use chorus_voice::audio::pcm_to_le_bytes;
    use chorus_voice::VoiceConfig;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    struct Running {
        handle: JoinHandle<Result<(), SessionError>>,
        browser: RemoteEnd,
        connector: Arc<MemoryConnector>,
        db: TestDb,
        conversation_id: String,
    }

    impl Running {
        async fn remote(&self, kind: ChannelKind) -> RemoteEnd {
            tokio::time::timeout(WAIT, async {
                loop {
                    if let Some(remote) = self.connector.take_remote(kind) {
                        return remote;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("channel was never dialed")
        }

        async fn send_audio(&self, level: i16, chunks: usize) {
            // 20 ms of 48 kHz mono per chunk.
            let bytes = pcm_to_le_bytes(&vec![level; 960]);
            for _ in 0..chunks {
                self.browser
                    .sender
                    .send(ChannelFrame::Binary(bytes.clone()))
                    .await
                    .unwrap();
            }
        }

        async fn send_browser(&self, message: Value) {
            self.browser
                .sender
                .send(ChannelFrame::Text(message.to_string()))
                .await
                .unwrap();
        }

        async fn stop(self) -> Vec<ConversationEvent> {
            self.send_browser(json!({"type": "session.stop"})).await;
            tokio::time::timeout(WAIT, self.handle)
                .await
                .expect("session did not stop")
                .unwrap()
                .unwrap();
            self.db.events(&self.conversation_id)
        }
    }

    fn state_for(
        turn_mode: TurnMode,
        connector: Arc<MemoryConnector>,
        db: &TestDb,
    ) -> Arc<AppState> {
        let config = Config {
            voice: VoiceConfig {
                turn_mode,
                ..VoiceConfig::default()
            },
            ..Config::default()
        };
        Arc::new(AppState::new(db.pool.clone(), config, connector))
    }

    fn params(session_id: &str, turn_mode: TurnMode) -> SessionParams {
        SessionParams {
            session_id: session_id.to_string(),
            conversation_id: "conv-session".to_string(),
            turn_mode,
        }
    }

    fn spawn_session(
        state: &Arc<AppState>,
        session_id: &str,
    ) -> (JoinHandle<Result<(), SessionError>>, RemoteEnd) {
        let (link, browser) = link_pair();
        let params = params(session_id, state.config.voice.turn_mode);
        (tokio::spawn(run_session(state.clone(), link, params)), browser)
    }

    fn start(turn_mode: TurnMode, connector: MemoryConnector) -> Running {
        let db = TestDb::new();
        let connector = Arc::new(connector);
        let state = state_for(turn_mode, connector.clone(), &db);
        let (handle, browser) = spawn_session(&state, "s-1");
        Running {
            handle,
            browser,
            connector,
            db,
            conversation_id: "conv-session".to_string(),
        }
    }

    /// A session driven method by method, without its inbound loop.
    struct Direct {
        session: Session,
        model: RemoteEnd,
        browser: RemoteEnd,
        db: TestDb,
    }

    async fn direct(turn_mode: TurnMode) -> Direct {
        let db = TestDb::new();
        let connector = Arc::new(MemoryConnector::default());
        let state = state_for(turn_mode, connector.clone(), &db);
        let params = params("s-direct", turn_mode);
        let recorder = state
            .recorders
            .acquire(&params.conversation_id)
            .await
            .unwrap();
        let (mut session, _inbound) = Session::new(&state, recorder, &params).unwrap();
        let (link, browser) = link_pair();
        session.channels.attach(ChannelKind::Browser, link).unwrap();
        session
            .channels
            .connect(ChannelKind::SpeechModel)
            .await
            .unwrap();
        let model = connector.take_remote(ChannelKind::SpeechModel).unwrap();
        Direct {
            session,
            model,
            browser,
            db,
        }
    }

    fn speech_frame(format: AudioFormat) -> AudioFrame {
        AudioFrame::new(vec![9_000; format.samples_per_frame()], format)
    }

    /// Waits for the next text message on `remote` matching `pred`.
    async fn wait_for(remote: &mut RemoteEnd, pred: impl Fn(&Value) -> bool) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                match remote.received.recv().await {
                    Some(ChannelFrame::Text(text)) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        if pred(&value) {
                            return value;
                        }
                    }
                    Some(ChannelFrame::Binary(_)) => {}
                    None => panic!("channel closed while waiting"),
                }
            }
        })
        .await
        .expect("expected message never arrived")
    }

    fn of_type(ty: &'static str) -> impl Fn(&Value) -> bool {
        move |v| v["type"] == ty
    }

    fn count(events: &[ConversationEvent], event_type: &str) -> usize {
        events.iter().filter(|e| e.event_type == event_type).count()
    }

    #[tokio::test]
    async fn automatic_turn_is_flushed_to_the_model() {
        let session = start(TurnMode::Automatic, MemoryConnector::default());
        let mut model = session.remote(ChannelKind::SpeechModel).await;

        let update = wait_for(&mut model, |_| true).await;
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["turn_detection"]["type"], "server_vad");

        session.send_audio(9_000, 50).await;
        session.send_audio(0, 30).await;

        let append = wait_for(&mut model, |_| true).await;
        assert_eq!(append["type"], "input_audio_buffer.append");
        assert!(!append["audio"].as_str().unwrap().is_empty());

        let events = session.stop().await;
        assert_eq!(count(&events, event_types::SESSION_STARTED), 1);
        assert_eq!(count(&events, event_types::TURN_COMMITTED), 1);
        assert_eq!(events.last().unwrap().event_type, event_types::SESSION_ENDED);
        assert!(events.windows(2).all(|w| w[0].seq + 1 == w[1].seq));

        // Automatic mode leaves the commit to the model's own detector.
        while let Ok(frame) = model.received.try_recv() {
            if let ChannelFrame::Text(text) = frame {
                assert!(!text.contains("input_audio_buffer.commit"));
            }
        }
    }

    #[tokio::test]
    async fn manual_turn_waits_for_commit() {
        let session = start(TurnMode::Manual, MemoryConnector::default());
        let mut model = session.remote(ChannelKind::SpeechModel).await;
        let update = wait_for(&mut model, of_type("session.update")).await;
        assert!(update["session"]["turn_detection"].is_null());

        session.send_audio(9_000, 10).await;
        session.send_audio(0, 40).await;
        session
            .send_browser(json!({"type": "input_audio_buffer.commit"}))
            .await;

        wait_for(&mut model, of_type("input_audio_buffer.append")).await;
        wait_for(&mut model, of_type("input_audio_buffer.commit")).await;
        wait_for(&mut model, of_type("response.create")).await;

        let events = session.stop().await;
        let committed: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == event_types::TURN_COMMITTED)
            .collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].payload["reason"], "commit");
        assert_eq!(committed[0].payload["duration_ms"], 1000);
    }

    #[tokio::test]
    async fn uncommitted_audio_is_discarded_at_session_end() {
        let session = start(TurnMode::Manual, MemoryConnector::default());
        session.send_audio(9_000, 5).await;
        let events = session.stop().await;
        assert_eq!(count(&events, event_types::TURN_DISCARDED), 1);
        assert_eq!(count(&events, event_types::TURN_COMMITTED), 0);
    }

    #[tokio::test]
    async fn tool_call_reaches_team_and_outcome_returns_to_model() {
        let session = start(TurnMode::Automatic, MemoryConnector::default());
        let mut model = session.remote(ChannelKind::SpeechModel).await;
        let mut team = session.remote(ChannelKind::Team).await;
        wait_for(&mut model, of_type("session.update")).await;

        model
            .sender
            .send(ChannelFrame::Text(
                json!({
                    "type": "response.function_call_arguments.done",
                    "call_id": "call-1",
                    "name": "delegate_to_team",
                    "arguments": r#"{"text":"find flights to Lisbon"}"#,
                })
                .to_string(),
            ))
            .await
            .unwrap();

        let task = wait_for(&mut team, |_| true).await;
        assert_eq!(task, json!({"type": "user_message", "data": "find flights to Lisbon"}));

        let output = wait_for(&mut model, |v| v["item"]["type"] == "function_call_output").await;
        assert_eq!(output["item"]["call_id"], "call-1");
        assert_eq!(output["item"]["output"], r#"{"ok":true}"#);

        model
            .sender
            .send(ChannelFrame::Text(json!({"type": "response.done"}).to_string()))
            .await
            .unwrap();
        wait_for(&mut model, of_type("response.create")).await;

        let events = session.stop().await;
        assert_eq!(count(&events, event_types::TOOL_DISPATCHED), 1);
        assert!(events
            .iter()
            .any(|e| e.source == SourceTag::Voice && e.event_type == "response.done"));
    }

    #[tokio::test]
    async fn team_completion_is_narrated_once_per_run() {
        let mut session = start(TurnMode::Automatic, MemoryConnector::default());
        let mut model = session.remote(ChannelKind::SpeechModel).await;
        let team = session.remote(ChannelKind::Team).await;
        wait_for(&mut model, of_type("session.update")).await;

        for summary in ["Found 3 flights", "Found 3 flights again"] {
            team.sender
                .send(ChannelFrame::Text(
                    json!({"type": "result", "data": summary}).to_string(),
                ))
                .await
                .unwrap();
            let relayed = wait_for(&mut session.browser, of_type("channel.event")).await;
            assert_eq!(relayed["channel"], "team");
            assert_eq!(relayed["event"]["data"], summary);
        }

        let notice = wait_for(&mut model, |v| v["item"]["role"] == "system").await;
        let text = notice["item"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Found 3 flights"));
        wait_for(&mut model, of_type("response.create")).await;

        let events = session.stop().await;
        assert_eq!(count(&events, event_types::NARRATION_SENT), 1);
        assert_eq!(
            events
                .iter()
                .filter(|e| e.source == SourceTag::Team && e.event_type == "result")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn model_connect_failure_ends_the_session() {
        let connector = MemoryConnector::default();
        connector.refuse(ChannelKind::SpeechModel);
        let mut session = start(TurnMode::Automatic, connector);

        let error = wait_for(&mut session.browser, of_type("error")).await;
        assert_eq!(error["message"], "voice service unavailable");

        tokio::time::timeout(WAIT, session.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let events = session.db.events(&session.conversation_id);
        assert_eq!(count(&events, event_types::SESSION_STARTED), 0);
        let ended = events.last().unwrap();
        assert_eq!(ended.event_type, event_types::SESSION_ENDED);
        assert!(ended.payload["reason"]
            .as_str()
            .unwrap()
            .starts_with("speech model connect failed"));
    }

    #[tokio::test]
    async fn missing_team_does_not_block_the_session() {
        let connector = MemoryConnector::default();
        connector.refuse(ChannelKind::Team);
        connector.refuse(ChannelKind::Coder);
        let mut session = start(TurnMode::Automatic, connector);

        let ready = wait_for(&mut session.browser, of_type("session.ready")).await;
        assert_eq!(ready["conversation_id"], "conv-session");

        let events = session.stop().await;
        assert_eq!(count(&events, event_types::SESSION_STARTED), 1);
    }

    #[tokio::test]
    async fn model_audio_is_played_to_the_browser_unrecorded() {
        let mut session = start(TurnMode::Automatic, MemoryConnector::default());
        let model = session.remote(ChannelKind::SpeechModel).await;

        // 40 ms at the model's 24 kHz.
        let audio = chorus_voice::audio::encode_base64_pcm(&vec![1_000i16; 960]);
        model
            .sender
            .send(ChannelFrame::Text(
                json!({"type": "response.audio.delta", "delta": audio}).to_string(),
            ))
            .await
            .unwrap();

        let frame = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(ChannelFrame::Binary(bytes)) = session.browser.received.recv().await {
                    return bytes;
                }
            }
        })
        .await
        .unwrap();
        // 20 ms at the browser's 48 kHz, mono.
        assert_eq!(frame.len(), 960 * 2);

        let events = session.stop().await;
        assert_eq!(count(&events, "response.audio.delta"), 0);
    }

    #[tokio::test]
    async fn long_manual_turn_is_delivered_whole() {
        let Direct {
            mut session,
            mut model,
            browser: _browser,
            db,
        } = direct(TurnMode::Manual).await;

        let reader = tokio::spawn(async move {
            let (mut appends, mut commits, mut creates) = (0, 0, 0);
            while let Some(frame) = model.received.recv().await {
                let ChannelFrame::Text(text) = frame else {
                    continue;
                };
                let value: Value = serde_json::from_str(&text).unwrap();
                match value["type"].as_str() {
                    Some("input_audio_buffer.append") => appends += 1,
                    Some("input_audio_buffer.commit") => commits += 1,
                    Some("response.create") => creates += 1,
                    _ => {}
                }
            }
            (appends, commits, creates)
        });

        // 70 s of speech: more appends than the outbound queue holds.
        let format = session.input.target();
        for _ in 0..3500 {
            session.on_model_frame(speech_frame(format)).await;
        }
        let flow = session
            .on_browser_text(r#"{"type": "input_audio_buffer.commit"}"#)
            .await;
        assert!(flow.is_continue());
        session.shutdown("test finished");

        assert_eq!(reader.await.unwrap(), (70, 1, 1));
        session.recorder.flush().await;
        let events = db.events("conv-session");
        let committed: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == event_types::TURN_COMMITTED)
            .collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].payload["duration_ms"], 70_000);
        assert_eq!(count(&events, event_types::TURN_UNDELIVERED), 0);
    }

    #[tokio::test]
    async fn undeliverable_turn_is_recorded_and_reported() {
        let Direct {
            mut session,
            model,
            mut browser,
            db,
        } = direct(TurnMode::Manual).await;
        drop(model);

        let format = session.input.target();
        for _ in 0..100 {
            session.on_model_frame(speech_frame(format)).await;
        }
        let _ = session
            .on_browser_text(r#"{"type": "input_audio_buffer.commit"}"#)
            .await;

        let error = wait_for(&mut browser, of_type("error")).await;
        assert!(error["message"].as_str().unwrap().contains("could not be delivered"));

        session.recorder.flush().await;
        let events = db.events("conv-session");
        assert_eq!(count(&events, event_types::TURN_COMMITTED), 0);
        let undelivered: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == event_types::TURN_UNDELIVERED)
            .collect();
        assert_eq!(undelivered.len(), 1);
        assert_eq!(undelivered[0].payload["messages_sent"], 0);
        assert_eq!(undelivered[0].payload["messages_total"], 4);
    }

    #[tokio::test]
    async fn browser_control_messages_wait_out_a_full_queue() {
        let Direct {
            mut session,
            model: _model,
            mut browser,
            db: _db,
        } = direct(TurnMode::Manual).await;

        for _ in 0..CHANNEL_QUEUE_CAPACITY {
            session
                .channels
                .send(ChannelKind::Browser, ChannelFrame::Binary(vec![0; 4]))
                .unwrap();
        }
        // Audio is still dropped while the queue is full.
        session
            .send_browser(ChannelFrame::Binary(vec![1; 4]))
            .await;

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut binary = Vec::new();
            let committed = loop {
                match browser.received.recv().await {
                    Some(ChannelFrame::Binary(bytes)) => binary.push(bytes),
                    Some(ChannelFrame::Text(text)) => {
                        break serde_json::from_str::<Value>(&text).unwrap();
                    }
                    None => panic!("browser channel closed"),
                }
            };
            (binary, committed)
        });

        let format = session.input.target();
        for _ in 0..10 {
            session.on_model_frame(speech_frame(format)).await;
        }
        let _ = session
            .on_browser_text(r#"{"type": "input_audio_buffer.commit"}"#)
            .await;

        let (binary, committed) = reader.await.unwrap();
        assert_eq!(binary.len(), CHANNEL_QUEUE_CAPACITY);
        assert!(binary.iter().all(|bytes| bytes == &vec![0; 4]));
        assert_eq!(committed["type"], "turn.committed");
        assert_eq!(committed["duration_ms"], 200);
    }

    #[tokio::test]
    async fn concurrent_sessions_share_one_conversation_log() {
        let db = TestDb::new();
        let connector = Arc::new(MemoryConnector::default());
        let state = state_for(TurnMode::Automatic, connector, &db);

        let (first, mut first_browser) = spawn_session(&state, "s-first");
        let (second, mut second_browser) = spawn_session(&state, "s-second");
        wait_for(&mut first_browser, of_type("session.ready")).await;
        wait_for(&mut second_browser, of_type("session.ready")).await;

        for browser in [&first_browser, &second_browser] {
            for ty in ["note", "session.stop"] {
                browser
                    .sender
                    .send(ChannelFrame::Text(json!({ "type": ty }).to_string()))
                    .await
                    .unwrap();
            }
        }
        for handle in [first, second] {
            tokio::time::timeout(WAIT, handle)
                .await
                .expect("session did not stop")
                .unwrap()
                .unwrap();
        }

        let events = db.events("conv-session");
        assert_eq!(count(&events, event_types::SESSION_STARTED), 2);
        assert_eq!(count(&events, event_types::SESSION_ENDED), 2);
        assert_eq!(count(&events, "note"), 2);
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=events.len() as i64).collect::<Vec<_>>());
        assert_eq!(state.recorders.live_conversations().await, 0);
    }

    #[test]
    fn completion_is_detected_by_type_or_status() {
        assert!(is_completion("result", &json!({})));
        assert!(is_completion("progress", &json!({"status": "completed"})));
        assert!(!is_completion("progress", &json!({"status": "running"})));
    }

    #[test]
    fn summary_prefers_text_fields_and_is_bounded() {
        assert_eq!(summarize(&json!({"data": "3 flights found"})), "3 flights found");
        assert_eq!(summarize(&json!({"n": 1})), r#"{"n":1}"#);
        let long = "x".repeat(NARRATION_MAX_CHARS * 2);
        assert_eq!(
            summarize(&json!({ "content": long })).chars().count(),
            NARRATION_MAX_CHARS + 3
        );
    }

    #[test]
    fn browser_controls_parse() {
        let commit: BrowserControl =
            serde_json::from_value(json!({"type": "input_audio_buffer.commit"})).unwrap();
        assert!(matches!(commit, BrowserControl::Commit));
        let configure: BrowserControl = serde_json::from_value(
            json!({"type": "audio.configure", "model_sample_rate": 48000}),
        )
        .unwrap();
        assert!(matches!(
            configure,
            BrowserControl::AudioConfigure {
                model_sample_rate: Some(48000),
                gain: None,
                ..
            }
        ));
        assert!(serde_json::from_value::<BrowserControl>(json!({"type": "ping"})).is_err());
    }
}
