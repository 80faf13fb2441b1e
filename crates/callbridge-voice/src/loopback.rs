//! In-process voice provider.
//!
//! The loopback provider places no real calls. [`LoopbackInitiator`] hands
//! out synthetic conversation ids and [`LoopbackConnector`] opens channels
//! whose far end is a [`LoopbackRemote`], which plays the provider: it can
//! open the channel, push inbound frames, drop the connection, and read what
//! the server sent.
//!
//! The server selects it with `voice.mode = "loopback"`; test suites drive
//! the remote ends directly.

use crate::channel::{
    ChannelConnector, ChannelEvent, ChannelHandle, ChannelState, SendCommand, StateCell,
    VoiceChannel,
};
use crate::error::VoiceError;
use crate::initiator::CallInitiator;
use crate::protocol::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use callbridge_types::EmergencyReport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

const LOOPBACK_QUEUE_CAPACITY: usize = 256;

/// Opening line spoken by the simulated dispatcher.
const SIMULATED_GREETING: &str = "Emergency services. I have your report. Can you confirm the address?";

/// Synthetic call initiator.
#[derive(Debug, Default)]
pub struct LoopbackInitiator {
    counter: AtomicU64,
    failure: Option<String>,
    delay: Option<Duration>,
    briefings: Mutex<Vec<String>>,
}

impl LoopbackInitiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An initiator whose every call fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Holds each initiation for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of initiation attempts seen so far.
    pub fn attempts(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Briefings received so far, oldest first.
    pub fn briefings(&self) -> Vec<String> {
        match self.briefings.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl CallInitiator for LoopbackInitiator {
    async fn initiate(
        &self,
        report: &EmergencyReport,
        briefing: &str,
    ) -> Result<String, VoiceError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        match self.briefings.lock() {
            Ok(mut guard) => guard.push(briefing.to_string()),
            Err(poisoned) => poisoned.into_inner().push(briefing.to_string()),
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(VoiceError::Provider(message.clone()));
        }
        info!(
            service = report.service_needed.as_str(),
            attempt = n,
            "loopback call placed"
        );
        Ok(format!("loopback_conv_{}", n))
    }
}

/// How a [`LoopbackConnector`] treats new channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteMode {
    /// Remote ends are handed to the caller of [`LoopbackConnector::new`].
    Manual { auto_open: bool },
    /// Remote ends run a tiny scripted dispatcher.
    Simulated,
}

/// Opens loopback channels.
#[derive(Debug)]
pub struct LoopbackConnector {
    mode: RemoteMode,
    remotes: Option<mpsc::UnboundedSender<LoopbackRemote>>,
    failure: Option<String>,
}

impl LoopbackConnector {
    /// A connector whose remote ends are delivered on the returned receiver.
    ///
    /// With `auto_open` the channel is already open when `connect` returns.
    pub fn new(auto_open: bool) -> (Self, mpsc::UnboundedReceiver<LoopbackRemote>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                mode: RemoteMode::Manual { auto_open },
                remotes: Some(tx),
                failure: None,
            },
            rx,
        )
    }

    /// A connector whose remote ends greet the caller and acknowledge
    /// every contextual update, for running the server without a provider.
    pub fn simulated() -> Self {
        Self {
            mode: RemoteMode::Simulated,
            remotes: None,
            failure: None,
        }
    }

    /// A connector that refuses every channel with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            mode: RemoteMode::Manual { auto_open: false },
            remotes: None,
            failure: Some(message.into()),
        }
    }
}

#[async_trait]
impl ChannelConnector for LoopbackConnector {
    async fn connect(&self, conversation_id: &str) -> Result<ChannelHandle, VoiceError> {
        if let Some(message) = &self.failure {
            return Err(VoiceError::Channel(message.clone()));
        }

        let (handle, remote) = pair(conversation_id);
        match self.mode {
            RemoteMode::Manual { auto_open } => {
                if auto_open {
                    remote.open().await;
                }
                if let Some(remotes) = &self.remotes {
                    if remotes.send(remote).is_err() {
                        debug!(conversation_id, "loopback remote dropped, nobody is listening");
                    }
                }
            }
            RemoteMode::Simulated => {
                tokio::spawn(run_simulated_dispatcher(remote));
            }
        }
        Ok(handle)
    }
}

/// Far end of a loopback channel.
#[derive(Debug)]
pub struct LoopbackRemote {
    conversation_id: String,
    state: StateCell,
    events: mpsc::Sender<ChannelEvent>,
    outbound: mpsc::Receiver<OutboundMessage>,
    fail_sends: Arc<AtomicBool>,
}

impl LoopbackRemote {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// Completes the handshake.
    pub async fn open(&self) {
        if self.state.get() == ChannelState::Connecting {
            self.state.set(ChannelState::Open);
            self.emit(ChannelEvent::Open).await;
        }
    }

    /// Delivers one inbound frame.
    pub async fn push(&self, message: InboundMessage) {
        self.emit(ChannelEvent::Message(message)).await;
    }

    pub async fn respond(&self, text: impl Into<String>) {
        self.push(InboundMessage::AgentResponse { text: text.into() }).await;
    }

    pub async fn transcript(&self, text: impl Into<String>) {
        self.push(InboundMessage::AgentTranscript { text: text.into() }).await;
    }

    /// Delivers a frame that failed to parse.
    pub async fn malformed(&self, detail: impl Into<String>) {
        self.emit(ChannelEvent::Malformed(detail.into())).await;
    }

    /// Drops the connection from the provider side.
    pub async fn drop_connection(&self, code: u16, reason: impl Into<String>) {
        self.state.set(ChannelState::Closed);
        self.emit(ChannelEvent::Closed {
            code,
            reason: reason.into(),
        })
        .await;
    }

    /// Fails the transport.
    pub async fn fail(&self, error: impl Into<String>) {
        self.state.set(ChannelState::Closed);
        self.emit(ChannelEvent::Error(error.into())).await;
    }

    /// Makes subsequent sends from the server fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Next frame the server sent, or `None` once the channel is gone.
    pub async fn next_outbound(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }

    /// Like [`Self::next_outbound`], giving up after `timeout`.
    pub async fn next_outbound_within(&mut self, timeout: Duration) -> Option<OutboundMessage> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    async fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            debug!(conversation_id = %self.conversation_id, "loopback event dropped, channel gone");
        }
    }
}

/// Builds a connected channel handle and its far end.
fn pair(conversation_id: &str) -> (ChannelHandle, LoopbackRemote) {
    let state = StateCell::new(ChannelState::Connecting);
    let close = Arc::new(Notify::new());
    let fail_sends = Arc::new(AtomicBool::new(false));
    let (commands_tx, commands_rx) = mpsc::channel(LOOPBACK_QUEUE_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(LOOPBACK_QUEUE_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(LOOPBACK_QUEUE_CAPACITY);

    tokio::spawn(run_loopback_transport(
        conversation_id.to_string(),
        state.clone(),
        close.clone(),
        commands_rx,
        outbound_tx,
        events_tx.clone(),
        fail_sends.clone(),
    ));

    let handle = ChannelHandle {
        channel: VoiceChannel::new(conversation_id.to_string(), commands_tx, state.clone(), close),
        events: events_rx,
    };
    let remote = LoopbackRemote {
        conversation_id: conversation_id.to_string(),
        state,
        events: events_tx,
        outbound: outbound_rx,
        fail_sends,
    };
    (handle, remote)
}

async fn run_loopback_transport(
    conversation_id: String,
    state: StateCell,
    close: Arc<Notify>,
    mut commands: mpsc::Receiver<SendCommand>,
    outbound: mpsc::Sender<OutboundMessage>,
    events: mpsc::Sender<ChannelEvent>,
    fail_sends: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            () = close.notified() => {
                if state.get() != ChannelState::Closed {
                    state.set(ChannelState::Closed);
                    let _ = events
                        .send(ChannelEvent::Closed { code: 1000, reason: "closed by client".to_string() })
                        .await;
                }
                debug!(conversation_id = %conversation_id, "loopback channel closed");
                return;
            }
            cmd = commands.recv() => {
                let Some(SendCommand { message, ack }) = cmd else { return };
                let result = if fail_sends.load(Ordering::SeqCst) {
                    Err(VoiceError::Channel("simulated send failure".to_string()))
                } else if outbound.send(message).await.is_err() {
                    Err(VoiceError::Channel("remote end is gone".to_string()))
                } else {
                    Ok(())
                };
                let _ = ack.send(result);
            }
        }
    }
}

async fn run_simulated_dispatcher(mut remote: LoopbackRemote) {
    remote.open().await;
    remote.respond(SIMULATED_GREETING).await;
    while let Some(frame) = remote.next_outbound().await {
        match frame {
            OutboundMessage::ContextualUpdate { text, .. } => {
                remote.respond(format!("Understood: {}", text)).await;
            }
            OutboundMessage::Pong => {}
        }
    }
}
