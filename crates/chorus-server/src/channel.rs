//! Channel supervision: connection lifecycle for every channel of a session.
//!
//! Each channel (browser, speech model, team, coder) moves through
//! [`ChannelState`] independently. Inbound messages from every channel are
//! funnelled into one queue so the session handles them at a single
//! dispatch point, tagged with the channel's attach generation so messages
//! from a connection that has since been reset can be told apart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_observe::{event_types, EventRecorder};
use chorus_types::{ChannelKind, ChannelState, SourceTag};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::{ChannelsConfig, SpeechModelConfig};

/// Capacity of each channel's outbound and inbound queues.
pub const CHANNEL_QUEUE_CAPACITY: usize = 64;

/// Longest a control message waits for outbound queue space.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0} channel unavailable")]
    Unavailable(ChannelKind),

    #[error("{0} channel is saturated; message dropped")]
    Saturated(ChannelKind),

    #[error("failed to connect {kind} channel: {reason}")]
    Connect { kind: ChannelKind, reason: String },

    #[error("illegal {kind} channel transition {from} -> {to}")]
    InvalidTransition {
        kind: ChannelKind,
        from: ChannelState,
        to: ChannelState,
    },

    #[error("{0} channel has no configured endpoint")]
    NotConfigured(ChannelKind),
}

/// One message on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// The two ends of an open connection, as seen by the session.
#[derive(Debug)]
pub struct ChannelLink {
    pub outbound: mpsc::Sender<ChannelFrame>,
    pub inbound: mpsc::Receiver<ChannelFrame>,
}

/// Opens connections to remote endpoints.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, kind: ChannelKind) -> Result<ChannelLink, ChannelError>;
}

/// What the session loop receives from a channel.
#[derive(Debug)]
pub enum InboundPayload {
    Frame(ChannelFrame),
    /// The remote side went away.
    Closed,
}

#[derive(Debug)]
pub struct Inbound {
    pub kind: ChannelKind,
    pub generation: u64,
    pub payload: InboundPayload,
}

/// Connects to the speech model and the downstream channels over WebSocket.
pub struct WsConnector {
    speech_model: SpeechModelConfig,
    channels: ChannelsConfig,
}

impl WsConnector {
    pub fn new(speech_model: SpeechModelConfig, channels: ChannelsConfig) -> Self {
        Self {
            speech_model,
            channels,
        }
    }

    fn endpoint(&self, kind: ChannelKind) -> Result<String, ChannelError> {
        let url = match kind {
            ChannelKind::SpeechModel => {
                let base = &self.speech_model.url;
                if self.speech_model.model.is_empty() || base.contains("model=") {
                    base.clone()
                } else if base.contains('?') {
                    format!("{base}&model={}", self.speech_model.model)
                } else {
                    format!("{base}?model={}", self.speech_model.model)
                }
            }
            ChannelKind::Team => self.channels.team_url.clone().unwrap_or_default(),
            ChannelKind::Coder => self.channels.coder_url.clone().unwrap_or_default(),
            // The browser dials us.
            ChannelKind::Browser => String::new(),
        };
        if url.trim().is_empty() {
            Err(ChannelError::NotConfigured(kind))
        } else {
            Ok(url)
        }
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, kind: ChannelKind) -> Result<ChannelLink, ChannelError> {
        let url = self.endpoint(kind)?;
        let connect_err = |reason: String| ChannelError::Connect { kind, reason };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_err(e.to_string()))?;
        if kind == ChannelKind::SpeechModel && !self.speech_model.api_key.is_empty() {
            let headers = request.headers_mut();
            headers.insert(
                "Authorization",
                format!("Bearer {}", self.speech_model.api_key)
                    .parse()
                    .map_err(|_| connect_err("invalid api key header".to_string()))?,
            );
            headers.insert(
                "OpenAI-Beta",
                "realtime=v1"
                    .parse()
                    .map_err(|_| connect_err("invalid header".to_string()))?,
            );
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ChannelFrame>(CHANNEL_QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ChannelFrame>(CHANNEL_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let msg = match frame {
                    ChannelFrame::Text(text) => WsMessage::Text(text.into()),
                    ChannelFrame::Binary(bytes) => WsMessage::Binary(bytes.into()),
                };
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(channel = kind.as_str(), error = %e, "websocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(result) = source.next().await {
                let frame = match result {
                    Ok(WsMessage::Text(text)) => ChannelFrame::Text(text.as_str().to_owned()),
                    Ok(WsMessage::Binary(bytes)) => ChannelFrame::Binary(bytes.to_vec()),
                    Ok(WsMessage::Close(frame)) => {
                        tracing::info!(
                            channel = kind.as_str(),
                            close_frame = ?frame,
                            "remote closed channel"
                        );
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(
                            channel = kind.as_str(),
                            error = %e,
                            "websocket receive failed"
                        );
                        break;
                    }
                };
                if inbound_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(ChannelLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

struct ChannelSlot {
    state: ChannelState,
    generation: u64,
    outbound: Option<mpsc::Sender<ChannelFrame>>,
    forwarder: Option<JoinHandle<()>>,
}

impl ChannelSlot {
    fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            generation: 0,
            outbound: None,
            forwarder: None,
        }
    }
}

/// Owns every channel of one session.
pub struct ChannelSupervisor {
    session_id: String,
    connector: Arc<dyn ChannelConnector>,
    recorder: Arc<EventRecorder>,
    slots: HashMap<ChannelKind, ChannelSlot>,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl ChannelSupervisor {
    /// Creates a supervisor with every channel disconnected. The returned
    /// receiver yields inbound traffic from all channels in arrival order.
    pub fn new(
        session_id: impl Into<String>,
        connector: Arc<dyn ChannelConnector>,
        recorder: Arc<EventRecorder>,
    ) -> (Self, mpsc::Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY * 4);
        let slots = ChannelKind::ALL
            .into_iter()
            .map(|kind| (kind, ChannelSlot::new()))
            .collect();
        (
            Self {
                session_id: session_id.into(),
                connector,
                recorder,
                slots,
                inbound_tx,
            },
            inbound_rx,
        )
    }

    pub fn state(&self, kind: ChannelKind) -> ChannelState {
        self.slots
            .get(&kind)
            .map_or(ChannelState::Disconnected, |slot| slot.state)
    }

    /// The attach generation of `kind`; inbound messages carrying an older
    /// generation come from a connection that has been replaced.
    pub fn generation(&self, kind: ChannelKind) -> u64 {
        self.slots.get(&kind).map_or(0, |slot| slot.generation)
    }

    pub fn is_current(&self, inbound: &Inbound) -> bool {
        self.generation(inbound.kind) == inbound.generation
    }

    /// Dials `kind` through the connector and opens it.
    pub async fn connect(&mut self, kind: ChannelKind) -> Result<(), ChannelError> {
        if self.state(kind) == ChannelState::Error {
            self.transition(kind, ChannelState::Disconnected)?;
        }
        self.transition(kind, ChannelState::Connecting)?;
        match self.connector.connect(kind).await {
            Ok(link) => {
                self.open(kind, link)?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    channel = kind.as_str(),
                    error = %e,
                    "channel connect failed"
                );
                self.transition(kind, ChannelState::Error)?;
                Err(e)
            }
        }
    }

    /// Adopts a connection that was opened elsewhere (the browser socket).
    pub fn attach(&mut self, kind: ChannelKind, link: ChannelLink) -> Result<(), ChannelError> {
        if self.state(kind) == ChannelState::Error {
            self.transition(kind, ChannelState::Disconnected)?;
        }
        self.transition(kind, ChannelState::Connecting)?;
        self.open(kind, link)
    }

    fn open(&mut self, kind: ChannelKind, link: ChannelLink) -> Result<(), ChannelError> {
        let ChannelLink {
            outbound,
            mut inbound,
        } = link;
        let generation = self.generation(kind) + 1;
        let merged = self.inbound_tx.clone();
        let session_id = self.session_id.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let message = Inbound {
                    kind,
                    generation,
                    payload: InboundPayload::Frame(frame),
                };
                // Audio is real-time: drop it rather than queue behind a
                // slow consumer. Control messages keep their order.
                if matches!(message.payload, InboundPayload::Frame(ChannelFrame::Binary(_))) {
                    if let Err(mpsc::error::TrySendError::Full(_)) = merged.try_send(message) {
                        tracing::debug!(
                            session_id = %session_id,
                            channel = kind.as_str(),
                            "inbound audio dropped"
                        );
                    }
                    continue;
                }
                if merged.send(message).await.is_err() {
                    return;
                }
            }
            let _ = merged
                .send(Inbound {
                    kind,
                    generation,
                    payload: InboundPayload::Closed,
                })
                .await;
        });

        if let Some(slot) = self.slots.get_mut(&kind) {
            slot.generation = generation;
            slot.outbound = Some(outbound);
            if let Some(old) = slot.forwarder.replace(forwarder) {
                old.abort();
            }
        }
        self.transition(kind, ChannelState::Open)
    }

    fn open_sender(&self, kind: ChannelKind) -> Result<&mpsc::Sender<ChannelFrame>, ChannelError> {
        match self.slots.get(&kind) {
            Some(ChannelSlot {
                outbound: Some(outbound),
                state: ChannelState::Open,
                ..
            }) => Ok(outbound),
            _ => Err(ChannelError::Unavailable(kind)),
        }
    }

    /// Sends on an open channel without waiting. Fails fast if the channel
    /// is not open or its queue is full. Meant for audio, where a late frame
    /// is worth less than a dropped one.
    pub fn send(&mut self, kind: ChannelKind, frame: ChannelFrame) -> Result<(), ChannelError> {
        let result = self.open_sender(kind)?.try_send(frame);
        match result {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ChannelError::Saturated(kind)),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_failed(kind);
                Err(ChannelError::Unavailable(kind))
            }
        }
    }

    pub fn send_json(
        &mut self,
        kind: ChannelKind,
        message: &serde_json::Value,
    ) -> Result<(), ChannelError> {
        self.send(kind, ChannelFrame::Text(message.to_string()))
    }

    /// Sends on an open channel, waiting up to [`DELIVERY_TIMEOUT`] for queue
    /// space so control messages keep their order instead of being dropped.
    /// Still fails fast if the channel is not open.
    pub async fn deliver(
        &mut self,
        kind: ChannelKind,
        frame: ChannelFrame,
    ) -> Result<(), ChannelError> {
        let outbound = self.open_sender(kind)?.clone();
        match outbound.send_timeout(frame, DELIVERY_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    channel = kind.as_str(),
                    "outbound queue stayed full; message not delivered"
                );
                Err(ChannelError::Saturated(kind))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.mark_failed(kind);
                Err(ChannelError::Unavailable(kind))
            }
        }
    }

    pub async fn deliver_json(
        &mut self,
        kind: ChannelKind,
        message: &serde_json::Value,
    ) -> Result<(), ChannelError> {
        self.deliver(kind, ChannelFrame::Text(message.to_string())).await
    }

    /// Records that `kind` failed underneath us. The channel stays in
    /// `Error` until it is explicitly reconnected.
    pub fn mark_failed(&mut self, kind: ChannelKind) {
        if !self.state(kind).can_transition_to(ChannelState::Error) {
            return;
        }
        if let Some(slot) = self.slots.get_mut(&kind) {
            slot.outbound = None;
        }
        if kind.is_anchor() {
            tracing::error!(
                session_id = %self.session_id,
                channel = kind.as_str(),
                "anchor channel lost"
            );
        } else {
            tracing::warn!(session_id = %self.session_id, channel = kind.as_str(), "channel lost");
        }
        let _ = self.transition(kind, ChannelState::Error);
    }

    /// Closes `kind` if it is open (or clears an error state).
    pub fn close(&mut self, kind: ChannelKind) {
        match self.state(kind) {
            ChannelState::Open => {
                let _ = self.transition(kind, ChannelState::Closing);
                self.release(kind);
                let _ = self.transition(kind, ChannelState::Disconnected);
            }
            ChannelState::Error | ChannelState::Closing => {
                self.release(kind);
                let _ = self.transition(kind, ChannelState::Disconnected);
            }
            ChannelState::Disconnected | ChannelState::Connecting => self.release(kind),
        }
    }

    /// Closes and reopens `kind`. Used only by the explicit reset path;
    /// downstream channels are never reconnected automatically.
    pub async fn reset(&mut self, kind: ChannelKind) -> Result<(), ChannelError> {
        self.close(kind);
        self.connect(kind).await
    }

    /// Closes every channel. Safe on a partially initialised session.
    pub fn teardown(&mut self) {
        for kind in ChannelKind::ALL {
            self.close(kind);
        }
    }

    fn release(&mut self, kind: ChannelKind) {
        if let Some(slot) = self.slots.get_mut(&kind) {
            // Dropping the sender ends the connection's writer task.
            slot.outbound = None;
            if let Some(forwarder) = slot.forwarder.take() {
                forwarder.abort();
            }
        }
    }

    fn transition(&mut self, kind: ChannelKind, next: ChannelState) -> Result<(), ChannelError> {
        let Some(slot) = self.slots.get_mut(&kind) else {
            return Err(ChannelError::Unavailable(kind));
        };
        let from = slot.state;
        if !from.can_transition_to(next) {
            return Err(ChannelError::InvalidTransition {
                kind,
                from,
                to: next,
            });
        }
        slot.state = next;
        tracing::info!(
            session_id = %self.session_id,
            channel = kind.as_str(),
            from = from.as_str(),
            to = next.as_str(),
            "channel state changed"
        );
        self.recorder.record(
            SourceTag::System,
            event_types::CHANNEL_STATE,
            serde_json::json!({
                "channel": kind.as_str(),
                "from": from.as_str(),
                "to": next.as_str(),
            }),
        );
        Ok(())
    }
}

impl Drop for ChannelSupervisor {
    fn drop(&mut self) {
        for slot in self.slots.values_mut() {
            if let Some(forwarder) = slot.forwarder.take() {
                forwarder.abort();
            }
        }
    }
}
