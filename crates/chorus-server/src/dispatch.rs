//! Tool dispatch: turning the speech model's function calls into commands
//! on the downstream execution channels.

use std::sync::Arc;
use std::time::Duration;

use chorus_observe::{event_types, EventRecorder};
use chorus_types::{ChannelKind, SourceTag, ToolName};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::channel::{ChannelError, ChannelSupervisor};
use crate::realtime;

/// One function call surfaced by the speech model, as received.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    /// Builds a request from the model's raw JSON argument string. Malformed
    /// or non-object arguments become an empty mapping; validation happens
    /// in [`ToolCall::parse`].
    pub fn from_raw(call_id: impl Into<String>, name: impl Into<String>, raw: &str) -> Self {
        let arguments = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    DelegateToTeam { text: String },
    DelegateToCoder { text: String },
    Pause,
    Reset,
    PauseCoder,
}

impl ToolCall {
    pub fn parse(request: &ToolCallRequest) -> Result<Self, DispatchError> {
        let tool: ToolName = request
            .name
            .parse()
            .map_err(|_| DispatchError::UnrecognizedTool(request.name.clone()))?;
        let text = || {
            request
                .arguments
                .get("text")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .ok_or(DispatchError::MissingArgument {
                    tool,
                    argument: "text",
                })
        };
        Ok(match tool {
            ToolName::DelegateToTeam => Self::DelegateToTeam { text: text()? },
            ToolName::DelegateToCoder => Self::DelegateToCoder { text: text()? },
            ToolName::Pause => Self::Pause,
            ToolName::Reset => Self::Reset,
            ToolName::PauseCoder => Self::PauseCoder,
        })
    }

    pub fn name(&self) -> ToolName {
        match self {
            Self::DelegateToTeam { .. } => ToolName::DelegateToTeam,
            Self::DelegateToCoder { .. } => ToolName::DelegateToCoder,
            Self::Pause => ToolName::Pause,
            Self::Reset => ToolName::Reset,
            Self::PauseCoder => ToolName::PauseCoder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unrecognized tool: {0}")]
    UnrecognizedTool(String),

    #[error("{tool} requires a non-empty {argument}")]
    MissingArgument {
        tool: ToolName,
        argument: &'static str,
    },

    #[error("{0} channel unavailable")]
    ChannelUnavailable(ChannelKind),
}

impl DispatchError {
    /// Stable, machine-readable error string returned to the model.
    pub fn code(&self) -> String {
        match self {
            Self::UnrecognizedTool(_) => "unrecognized tool".to_string(),
            Self::MissingArgument { argument, .. } => format!("missing {argument}"),
            Self::ChannelUnavailable(_) => "channel unavailable".to_string(),
        }
    }

    /// What the assistant should tell the user.
    pub fn notice(&self) -> String {
        match self {
            Self::UnrecognizedTool(name) => format!(
                "The tool \"{name}\" does not exist, so nothing was done. Tell the user briefly."
            ),
            Self::MissingArgument { tool, .. } => format!(
                "The {tool} request was empty, so nothing was sent. Ask the user what they want done."
            ),
            Self::ChannelUnavailable(kind) => format!(
                "The {} is not connected right now, so the request was not delivered. Tell the user.",
                channel_label(*kind)
            ),
        }
    }
}

fn channel_label(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Team => "agent team",
        ChannelKind::Coder => "coding agent",
        ChannelKind::SpeechModel => "voice service",
        ChannelKind::Browser => "browser",
    }
}

/// Result of one dispatch, returned to the model as the call's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The call was recognised as a reflexive pause and not acted on.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
}

impl DispatchOutcome {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            ignored: false,
        }
    }

    fn ignored() -> Self {
        Self {
            ignored: true,
            ..Self::ok()
        }
    }

    fn failed(error: &DispatchError) -> Self {
        Self {
            ok: false,
            error: Some(error.code()),
            ignored: false,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "ok": self.ok }))
    }
}

/// The most recent successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub tool: ToolName,
    pub at: Instant,
}

/// Per-run narration bookkeeping for the team channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub run_completed: bool,
    pub narrated_mid_run: bool,
}

/// Routes validated tool calls to downstream channels. One per session.
pub struct ToolDispatchExecutor {
    recorder: Arc<EventRecorder>,
    autopause_window: Duration,
    last_dispatch: Option<DispatchRecord>,
    flags: RunFlags,
}

impl ToolDispatchExecutor {
    pub fn new(recorder: Arc<EventRecorder>, autopause_window: Duration) -> Self {
        Self {
            recorder,
            autopause_window,
            last_dispatch: None,
            flags: RunFlags::default(),
        }
    }

    pub fn last_dispatch(&self) -> Option<DispatchRecord> {
        self.last_dispatch
    }

    pub fn flags(&self) -> RunFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut RunFlags {
        &mut self.flags
    }

    /// Executes one tool call. Failures are recorded and announced to the
    /// speech model; the outcome is returned either way.
    pub async fn dispatch(
        &mut self,
        request: &ToolCallRequest,
        channels: &mut ChannelSupervisor,
    ) -> DispatchOutcome {
        let call = match ToolCall::parse(request) {
            Ok(call) => call,
            Err(e) => return self.fail(request, e, channels).await,
        };
        let tool = call.name();

        if matches!(call, ToolCall::Pause | ToolCall::Reset) {
            if let Some(since) = self.within_autopause_window() {
                tracing::info!(
                    tool = tool.as_str(),
                    since_delegation_ms = since.as_millis() as u64,
                    "ignoring automatic pause right after delegation"
                );
                self.recorder.record(
                    SourceTag::System,
                    event_types::AUTOPAUSE_IGNORED,
                    json!({
                        "call_id": request.call_id,
                        "tool": tool.as_str(),
                        "since_delegation_ms": since.as_millis() as u64,
                        "window_ms": self.autopause_window.as_millis() as u64,
                    }),
                );
                return DispatchOutcome::ignored();
            }
        }

        let result = match &call {
            ToolCall::DelegateToTeam { text } | ToolCall::DelegateToCoder { text } => channels
                .send_json(tool.target(), &json!({ "type": "user_message", "data": text })),
            ToolCall::Pause | ToolCall::PauseCoder => {
                channels.send_json(tool.target(), &json!({ "type": "cancel" }))
            }
            ToolCall::Reset => channels.reset(ChannelKind::Team).await,
        };
        if let Err(e) = result {
            tracing::warn!(tool = tool.as_str(), error = %e, "tool dispatch failed on channel");
            let kind = match e {
                ChannelError::Unavailable(kind)
                | ChannelError::Saturated(kind)
                | ChannelError::NotConfigured(kind)
                | ChannelError::Connect { kind, .. }
                | ChannelError::InvalidTransition { kind, .. } => kind,
            };
            return self
                .fail(request, DispatchError::ChannelUnavailable(kind), channels)
                .await;
        }

        match call {
            ToolCall::DelegateToTeam { .. } => self.flags = RunFlags::default(),
            ToolCall::Reset => {
                self.flags = RunFlags::default();
                self.recorder.record(
                    SourceTag::System,
                    event_types::TEAM_CHANNEL_RESET,
                    json!({ "call_id": request.call_id }),
                );
            }
            _ => {}
        }
        self.last_dispatch = Some(DispatchRecord {
            tool,
            at: Instant::now(),
        });
        self.recorder.record(
            SourceTag::System,
            event_types::TOOL_DISPATCHED,
            json!({
                "call_id": request.call_id,
                "tool": tool.as_str(),
                "channel": tool.target().as_str(),
                "arguments": request.arguments,
            }),
        );
        DispatchOutcome::ok()
    }

    fn within_autopause_window(&self) -> Option<Duration> {
        let record = self.last_dispatch?;
        if record.tool != ToolName::DelegateToTeam {
            return None;
        }
        let since = Instant::now().saturating_duration_since(record.at);
        (since <= self.autopause_window).then_some(since)
    }

    async fn fail(
        &mut self,
        request: &ToolCallRequest,
        error: DispatchError,
        channels: &mut ChannelSupervisor,
    ) -> DispatchOutcome {
        tracing::warn!(
            call_id = %request.call_id,
            tool = %request.name,
            error = %error,
            "tool dispatch rejected"
        );
        let notice = error.notice();
        self.recorder.record(
            SourceTag::System,
            event_types::TOOL_DISPATCH_FAILED,
            json!({
                "call_id": request.call_id,
                "tool": request.name,
                "error": error.code(),
                "detail": error.to_string(),
                "notice": notice,
            }),
        );
        let message = realtime::system_notice(&notice);
        if let Err(e) = channels.deliver_json(ChannelKind::SpeechModel, &message).await {
            tracing::warn!(error = %e, "could not deliver failure notice to speech model");
        }
        DispatchOutcome::failed(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryConnector;
    use crate::channel::ChannelFrame;
    use crate::test_support::{recorder, TestDb};
    use chorus_observe::ConversationEvent;
    use chorus_types::ChannelState;

    const WINDOW: Duration = Duration::from_millis(1200);

    struct Harness {
        executor: ToolDispatchExecutor,
        channels: ChannelSupervisor,
        connector: Arc<MemoryConnector>,
        recorder: Arc<EventRecorder>,
        db: TestDb,
    }

    async fn harness(connect: &[ChannelKind]) -> Harness {
        let (recorder, db) = recorder("conv-dispatch").await;
        let connector = Arc::new(MemoryConnector::default());
        let (mut channels, _rx) =
            ChannelSupervisor::new("s-dispatch", connector.clone(), recorder.clone());
        for kind in connect {
            channels.connect(*kind).await.unwrap();
        }
        Harness {
            executor: ToolDispatchExecutor::new(recorder.clone(), WINDOW),
            channels,
            connector,
            recorder,
            db,
        }
    }

    impl Harness {
        async fn call(&mut self, name: &str, arguments: &str) -> DispatchOutcome {
            let request = ToolCallRequest::from_raw("call", name, arguments);
            self.executor.dispatch(&request, &mut self.channels).await
        }

        async fn events(&self) -> Vec<ConversationEvent> {
            self.recorder.flush().await;
            self.db.events("conv-dispatch")
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<ChannelFrame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(ChannelFrame::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn pause_right_after_delegation_is_ignored() {
        let mut h = harness(&[ChannelKind::SpeechModel, ChannelKind::Team]).await;
        let mut team = h.connector.take_remote(ChannelKind::Team).unwrap();

        assert_eq!(
            h.call("delegate_to_team", r#"{"text":"book a table"}"#).await,
            DispatchOutcome::ok()
        );
        tokio::time::advance(Duration::from_millis(400)).await;
        let outcome = h.call("pause", "{}").await;
        assert!(outcome.ok && outcome.ignored);

        let sent = drain(&mut team.received);
        assert_eq!(sent, vec![json!({"type": "user_message", "data": "book a table"})]);

        let events = h.events().await;
        assert!(events
            .iter()
            .any(|e| e.event_type == event_types::AUTOPAUSE_IGNORED));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_after_window_cancels_the_team() {
        let mut h = harness(&[ChannelKind::Team]).await;
        let mut team = h.connector.take_remote(ChannelKind::Team).unwrap();

        h.call("delegate_to_team", r#"{"text":"summarise the doc"}"#).await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        let outcome = h.call("pause", "{}").await;
        assert_eq!(outcome, DispatchOutcome::ok());

        let sent = drain(&mut team.received);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], json!({"type": "cancel"}));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_without_prior_delegation_cancels() {
        let mut h = harness(&[ChannelKind::Team]).await;
        let mut team = h.connector.take_remote(ChannelKind::Team).unwrap();
        assert_eq!(h.call("pause", "{}").await, DispatchOutcome::ok());
        assert_eq!(drain(&mut team.received), vec![json!({"type": "cancel"})]);
    }

    #[tokio::test]
    async fn empty_text_fails_and_sends_nothing() {
        let mut h =
            harness(&[ChannelKind::SpeechModel, ChannelKind::Team, ChannelKind::Coder]).await;
        let mut team = h.connector.take_remote(ChannelKind::Team).unwrap();
        let mut coder = h.connector.take_remote(ChannelKind::Coder).unwrap();
        let mut model = h.connector.take_remote(ChannelKind::SpeechModel).unwrap();

        for (tool, args) in [
            ("delegate_to_team", r#"{"text":"   "}"#),
            ("delegate_to_coder", "{}"),
            ("delegate_to_team", "not json"),
        ] {
            let outcome = h.call(tool, args).await;
            assert!(!outcome.ok);
            assert_eq!(outcome.error.as_deref(), Some("missing text"));
        }

        assert!(drain(&mut team.received).is_empty());
        assert!(drain(&mut coder.received).is_empty());
        let notices = drain(&mut model.received);
        assert_eq!(notices.len(), 3);
        assert_eq!(notices[0]["item"]["role"], "system");
        assert!(h.executor.last_dispatch().is_none());
    }

    #[tokio::test]
    async fn delegation_to_disconnected_team_reports_unavailable() {
        let mut h = harness(&[ChannelKind::SpeechModel]).await;
        let mut model = h.connector.take_remote(ChannelKind::SpeechModel).unwrap();

        let outcome = h.call("delegate_to_team", r#"{"text":"go"}"#).await;
        assert_eq!(
            outcome.to_value(),
            json!({"ok": false, "error": "channel unavailable"})
        );

        let events = h.events().await;
        let failed: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == event_types::TOOL_DISPATCH_FAILED)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload["error"], "channel unavailable");
        assert_eq!(drain(&mut model.received).len(), 1);
    }

    #[tokio::test]
    async fn failure_notice_waits_out_a_full_model_queue() {
        let mut h = harness(&[ChannelKind::SpeechModel]).await;
        let mut model = h.connector.take_remote(ChannelKind::SpeechModel).unwrap();
        for _ in 0..crate::channel::CHANNEL_QUEUE_CAPACITY {
            h.channels
                .send(ChannelKind::SpeechModel, ChannelFrame::Binary(vec![0; 4]))
                .unwrap();
        }

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            loop {
                match model.received.recv().await {
                    Some(ChannelFrame::Text(text)) => {
                        return serde_json::from_str::<Value>(&text).unwrap();
                    }
                    Some(ChannelFrame::Binary(_)) => {}
                    None => panic!("model channel closed before the notice"),
                }
            }
        });

        let outcome = h.call("launch_rockets", "{}").await;
        assert!(!outcome.ok);
        let notice = reader.await.unwrap();
        assert_eq!(notice["item"]["role"], "system");
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let mut h = harness(&[]).await;
        let outcome = h.call("launch_rockets", "{}").await;
        assert_eq!(outcome.error.as_deref(), Some("unrecognized tool"));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_reconnects_team_and_clears_flags() {
        let mut h = harness(&[ChannelKind::Team]).await;
        let old_team = h.connector.take_remote(ChannelKind::Team).unwrap();
        h.executor.flags_mut().run_completed = true;
        h.executor.flags_mut().narrated_mid_run = true;

        assert_eq!(h.call("reset", "{}").await, DispatchOutcome::ok());

        assert_eq!(h.channels.state(ChannelKind::Team), ChannelState::Open);
        assert_eq!(h.connector.dial_count(ChannelKind::Team), 2);
        assert_eq!(h.executor.flags(), RunFlags::default());

        let mut new_team = h.connector.take_remote(ChannelKind::Team).unwrap();
        assert!(drain(&mut new_team.received).is_empty(), "reset must not start a task");
        drop(old_team);

        let events = h.events().await;
        assert!(events
            .iter()
            .any(|e| e.event_type == event_types::TEAM_CHANNEL_RESET));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_right_after_delegation_is_ignored() {
        let mut h = harness(&[ChannelKind::Team]).await;
        h.call("delegate_to_team", r#"{"text":"draft the email"}"#).await;
        tokio::time::advance(Duration::from_millis(200)).await;
        let outcome = h.call("reset", "{}").await;
        assert!(outcome.ignored);
        assert_eq!(h.connector.dial_count(ChannelKind::Team), 1);
    }

    #[tokio::test]
    async fn delegation_resets_run_flags_and_coder_cancel_routes_to_coder() {
        let mut h = harness(&[ChannelKind::Team, ChannelKind::Coder]).await;
        let mut coder = h.connector.take_remote(ChannelKind::Coder).unwrap();
        h.executor.flags_mut().run_completed = true;

        h.call("delegate_to_team", r#"{"text":"next task"}"#).await;
        assert_eq!(h.executor.flags(), RunFlags::default());

        h.call("pause_coder", "{}").await;
        assert_eq!(drain(&mut coder.received), vec![json!({"type": "cancel"})]);
    }
}
