//! Duplex real-time channel to the voice provider.
//!
//! A [`VoiceChannel`] is a handle to a background task that owns the actual
//! transport. Lifecycle events and inbound frames come out of the task
//! through the [`ChannelHandle::events`] queue in the order they happened;
//! outbound frames go in through [`VoiceChannel::send`]. Dropping the handle
//! closes the channel.

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::protocol::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Capacity of the per-channel event queue.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Capacity of the per-channel outbound command queue.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Close code reported when the transport vanished without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Something that happened on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The handshake completed.
    Open,
    /// A frame from the provider.
    Message(InboundMessage),
    /// A frame that could not be parsed. Not fatal.
    Malformed(String),
    /// The channel closed. Always the last event.
    Closed { code: u16, reason: String },
    /// The transport failed. Followed by nothing; the channel is closed.
    Error(String),
}

/// Shared view of the channel state, written by the transport task.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new(state: ChannelState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves to `Closing` unless already closing or closed. Returns whether it moved.
    fn begin_close(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >= ChannelState::Closing as u8 {
                return false;
            }
            match self.0.compare_exchange(
                current,
                ChannelState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

pub(crate) type SendAck = oneshot::Sender<Result<(), VoiceError>>;

pub(crate) struct SendCommand {
    pub(crate) message: OutboundMessage,
    pub(crate) ack: SendAck,
}

/// Write side of a channel, cheap to clone for the duration of one send.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    commands: mpsc::Sender<SendCommand>,
    state: StateCell,
}

impl ChannelSender {
    /// Sends one frame and waits until the transport has written it.
    ///
    /// # Errors
    ///
    /// [`VoiceError::NotReady`] if the channel is not open, or
    /// [`VoiceError::Channel`] if the transport failed during the write.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), VoiceError> {
        if self.state.get() != ChannelState::Open {
            return Err(VoiceError::NotReady);
        }
        let (ack, done) = oneshot::channel();
        self.commands
            .send(SendCommand { message, ack })
            .await
            .map_err(|_| VoiceError::Channel("channel task has stopped".to_string()))?;
        done.await
            .map_err(|_| VoiceError::Channel("channel closed before the send completed".to_string()))?
    }

    /// Queues one frame without waiting for the transport to write it.
    ///
    /// # Errors
    ///
    /// [`VoiceError::NotReady`] if the channel is not open, or
    /// [`VoiceError::Channel`] if the queue is full or the task has stopped.
    pub fn try_send(&self, message: OutboundMessage) -> Result<(), VoiceError> {
        if self.state.get() != ChannelState::Open {
            return Err(VoiceError::NotReady);
        }
        // Nobody waits on the ack.
        let (ack, _) = oneshot::channel();
        self.commands
            .try_send(SendCommand { message, ack })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    VoiceError::Channel("outbound queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    VoiceError::Channel("channel task has stopped".to_string())
                }
            })
    }

    pub fn is_open(&self) -> bool {
        self.state.get() == ChannelState::Open
    }
}

/// Owning handle to a provider channel.
#[derive(Debug)]
pub struct VoiceChannel {
    conversation_id: String,
    sender: ChannelSender,
    close: Arc<Notify>,
}

impl VoiceChannel {
    pub(crate) fn new(
        conversation_id: String,
        commands: mpsc::Sender<SendCommand>,
        state: StateCell,
        close: Arc<Notify>,
    ) -> Self {
        Self {
            conversation_id,
            sender: ChannelSender { commands, state },
            close,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> ChannelState {
        self.sender.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub async fn send(&self, message: OutboundMessage) -> Result<(), VoiceError> {
        self.sender.send(message).await
    }

    /// Asks the transport to close. Idempotent.
    pub fn close(&self) {
        if self.sender.state.begin_close() {
            debug!(conversation_id = %self.conversation_id, "closing voice channel");
            self.close.notify_one();
        }
    }
}

impl Drop for VoiceChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// A freshly connected channel and the queue of its events.
#[derive(Debug)]
pub struct ChannelHandle {
    pub channel: VoiceChannel,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Opens provider channels for placed calls.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Starts opening a channel for `conversation_id`.
    ///
    /// Implementations may return before the handshake completes; the
    /// channel then reports [`ChannelState::Connecting`] and a
    /// [`ChannelEvent::Open`] follows once it is usable.
    async fn connect(&self, conversation_id: &str) -> Result<ChannelHandle, VoiceError>;
}

/// Connects to the provider's conversation WebSocket.
#[derive(Debug, Clone)]
pub struct WsChannelConnector {
    config: VoiceConfig,
}

impl WsChannelConnector {
    pub fn new(config: VoiceConfig) -> Self {
        Self { config }
    }

    fn url_for(&self, conversation_id: &str) -> String {
        let separator = if self.config.ws_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}agent_id={}&conversation_id={}",
            self.config.ws_url, separator, self.config.agent_id, conversation_id
        )
    }
}

#[async_trait]
impl ChannelConnector for WsChannelConnector {
    async fn connect(&self, conversation_id: &str) -> Result<ChannelHandle, VoiceError> {
        let mut request = self
            .url_for(conversation_id)
            .into_client_request()
            .map_err(|e| VoiceError::Channel(format!("invalid channel url: {}", e)))?;
        if !self.config.api_key.is_empty() {
            let key = HeaderValue::from_str(&self.config.api_key)
                .map_err(|_| VoiceError::Channel("api key is not a valid header value".to_string()))?;
            request.headers_mut().insert("xi-api-key", key);
        }

        let state = StateCell::new(ChannelState::Connecting);
        let close = Arc::new(Notify::new());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let task = SocketTask {
            conversation_id: conversation_id.to_string(),
            state: state.clone(),
            close: close.clone(),
            commands: commands_rx,
            events: events_tx,
            connect_timeout: self.config.connect_timeout(),
            ping_interval: self.config.ping_interval(),
        };
        tokio::spawn(task.run(request));

        Ok(ChannelHandle {
            channel: VoiceChannel::new(conversation_id.to_string(), commands_tx, state, close),
            events: events_rx,
        })
    }
}

struct SocketTask {
    conversation_id: String,
    state: StateCell,
    close: Arc<Notify>,
    commands: mpsc::Receiver<SendCommand>,
    events: mpsc::Sender<ChannelEvent>,
    connect_timeout: Duration,
    ping_interval: Duration,
}

impl SocketTask {
    async fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            debug!(conversation_id = %self.conversation_id, "channel event dropped, no listener");
        }
    }

    async fn run(
        mut self,
        request: tokio_tungstenite::tungstenite::handshake::client::Request,
    ) {
        let handshake = tokio::select! {
            res = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request)) => res,
            () = self.close.notified() => {
                self.state.set(ChannelState::Closed);
                self.emit(ChannelEvent::Closed { code: 1000, reason: "closed before open".to_string() }).await;
                return;
            }
        };

        let socket = match handshake {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => {
                warn!(conversation_id = %self.conversation_id, "voice channel handshake failed: {}", e);
                self.state.set(ChannelState::Closed);
                self.emit(ChannelEvent::Error(format!("handshake failed: {}", e))).await;
                return;
            }
            Err(_) => {
                let err = VoiceError::HandshakeTimeout(self.connect_timeout.as_millis() as u64);
                warn!(conversation_id = %self.conversation_id, "{}", err);
                self.state.set(ChannelState::Closed);
                self.emit(ChannelEvent::Error(err.to_string())).await;
                return;
            }
        };

        // A close requested during the handshake wins over the open.
        if !matches!(self.state.get(), ChannelState::Connecting) {
            let (mut sink, _) = socket.split();
            let _ = sink.send(Message::Close(None)).await;
            self.state.set(ChannelState::Closed);
            self.emit(ChannelEvent::Closed { code: 1000, reason: "closed by client".to_string() }).await;
            return;
        }

        self.state.set(ChannelState::Open);
        info!(conversation_id = %self.conversation_id, "voice channel open");
        self.emit(ChannelEvent::Open).await;

        let (mut sink, mut stream) = socket.split();
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );

        let (code, reason) = loop {
            tokio::select! {
                () = self.close.notified() => {
                    let frame = CloseFrame { code: CloseCode::Normal, reason: "closed by client".into() };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break (1000, "closed by client".to_string());
                }
                Some(cmd) = self.commands.recv() => {
                    let result = match cmd.message.to_json() {
                        Ok(json) => sink
                            .send(Message::Text(json.into()))
                            .await
                            .map_err(|e| VoiceError::Channel(e.to_string())),
                        Err(e) => Err(e),
                    };
                    let _ = cmd.ack.send(result);
                }
                _ = ping.tick() => {
                    if self.state.get() != ChannelState::Open {
                        break (1000, "closed by client".to_string());
                    }
                    if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                        warn!(conversation_id = %self.conversation_id, "keep-alive ping failed: {}", e);
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let event = match InboundMessage::parse(text.as_str()) {
                            Ok(msg) => ChannelEvent::Message(msg),
                            Err(e) => ChannelEvent::Malformed(e.to_string()),
                        };
                        self.emit(event).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) => (u16::from(f.code), f.reason.as_str().to_string()),
                            None => (1005, String::new()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(conversation_id = %self.conversation_id, "voice channel transport error: {}", e);
                        self.state.set(ChannelState::Closed);
                        self.emit(ChannelEvent::Error(e.to_string())).await;
                        return;
                    }
                    None => break (ABNORMAL_CLOSE_CODE, "connection dropped".to_string()),
                },
            }
        };

        self.state.set(ChannelState::Closed);
        info!(conversation_id = %self.conversation_id, code, reason = %reason, "voice channel closed");
        self.emit(ChannelEvent::Closed { code, reason }).await;
    }
}
