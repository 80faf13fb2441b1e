//! One reporter's call: placing it, relaying both directions, and ending it.
//!
//! A `Conversation` moves `Idle -> Calling -> Active -> Ended`, or straight
//! from `Calling` to `Ended` when setup fails. Every provider event for the
//! current attempt is consumed by a single pump task, so relayed messages
//! keep the provider's order. Each attempt carries a number; events from an
//! earlier attempt's channel are ignored.

use crate::admission::{AdmissionRejection, SessionCallRecord};
use crate::lock_or_recover;
use callbridge_types::{ChatMessage, EmergencyReport, MessageRole};
use callbridge_voice::{
    build_briefing, CallInitiator, ChannelConnector, ChannelEvent, ChannelHandle, ChannelSender,
    InboundMessage, OutboundMessage, VoiceChannel, VoiceError,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CALL_ENDED_NOTICE: &str = "The call has ended.";
pub const CONNECTION_LOST_NOTICE: &str = "Connection lost";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Calling,
    Active,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Active => "active",
            CallState::Ended => "ended",
        }
    }
}

/// Events delivered to relay subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Message(ChatMessage),
    Ended,
    Error(String),
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation is not active")]
    NotActive,
    #[error("voice channel is not ready")]
    NotReady,
    #[error("failed to send message: {0}")]
    SendFailed(String),
    #[error(transparent)]
    Provider(#[from] VoiceError),
    #[error("call was ended before it connected")]
    Cancelled,
}

/// Point-in-time view of a conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub session_id: String,
    pub state: CallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub call_initiated: bool,
    pub is_active: bool,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug)]
struct Inner {
    state: CallState,
    attempt: u64,
    conversation_id: Option<String>,
    channel: Option<VoiceChannel>,
    pump: Option<JoinHandle<()>>,
    call_initiated: bool,
    last_call_at_ms: Option<u64>,
    call_count: u32,
    messages: Vec<ChatMessage>,
}

impl Inner {
    fn is_current(&self, attempt: u64) -> bool {
        self.attempt == attempt
    }
}

#[derive(Debug)]
pub struct Conversation {
    session_id: String,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ConversationEvent>,
    state_tx: watch::Sender<CallState>,
}

impl Conversation {
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = watch::channel(CallState::Idle);
        Arc::new(Self {
            session_id: session_id.into(),
            inner: Mutex::new(Inner {
                state: CallState::Idle,
                attempt: 0,
                conversation_id: None,
                channel: None,
                pump: None,
                call_initiated: false,
                last_call_at_ms: None,
                call_count: 0,
                messages: Vec::new(),
            }),
            events,
            state_tx,
        })
    }

    /// A fresh conversation for a session that has placed calls before.
    pub(crate) fn resume(session_id: impl Into<String>, history: SessionCallRecord) -> Arc<Self> {
        let conversation = Self::new(session_id);
        {
            let mut inner = conversation.lock();
            inner.last_call_at_ms = history.last_call_at_ms;
            inner.call_count = history.call_count;
        }
        conversation
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_or_recover(&self.inner, "conversation")
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> CallState {
        self.lock().state
    }

    /// `true` only once the provider channel has confirmed it is open.
    pub fn is_active(&self) -> bool {
        self.state() == CallState::Active
    }

    pub fn call_initiated(&self) -> bool {
        self.lock().call_initiated
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.lock().conversation_id.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock().messages.clone()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let inner = self.lock();
        ConversationSnapshot {
            session_id: self.session_id.clone(),
            state: inner.state,
            conversation_id: inner.conversation_id.clone(),
            call_initiated: inner.call_initiated,
            is_active: inner.state == CallState::Active,
            messages: inner.messages.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn call_record(&self) -> SessionCallRecord {
        record_of(&self.lock())
    }

    /// Runs `check` against this session's record and, if it passes, marks a
    /// call as initiated. No await happens between check and mark.
    pub(crate) fn try_mark_call_initiated<F>(
        &self,
        now_ms: u64,
        check: F,
    ) -> Result<(), AdmissionRejection>
    where
        F: FnOnce(&SessionCallRecord) -> Result<(), AdmissionRejection>,
    {
        let mut inner = self.lock();
        check(&record_of(&inner))?;

        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        inner.channel = None;
        inner.attempt += 1;
        inner.state = CallState::Calling;
        inner.conversation_id = None;
        inner.call_initiated = true;
        inner.last_call_at_ms = Some(now_ms);
        inner.call_count = inner.call_count.saturating_add(1);
        self.state_tx.send_replace(CallState::Calling);
        debug!(
            session_id = %self.session_id,
            attempt = inner.attempt,
            "call marked as initiated"
        );
        Ok(())
    }

    /// Places the call and wires the provider channel.
    ///
    /// Returns once the channel is attached; it may still be handshaking.
    /// Any failure ends the attempt and releases the session's call guard.
    pub async fn begin_call(
        self: &Arc<Self>,
        report: &EmergencyReport,
        initiator: &dyn CallInitiator,
        connector: &dyn ChannelConnector,
    ) -> Result<(), ConversationError> {
        let attempt = {
            let inner = self.lock();
            if inner.state != CallState::Calling {
                return Err(ConversationError::Cancelled);
            }
            inner.attempt
        };

        let briefing = build_briefing(report);
        let conversation_id = match initiator.initiate(report, &briefing).await {
            Ok(id) => id,
            Err(e) => {
                warn!(session_id = %self.session_id, "call initiation failed: {}", e);
                self.fail_attempt(attempt, &format!("Call failed: {}", e));
                return Err(e.into());
            }
        };

        {
            let mut inner = self.lock();
            if !inner.is_current(attempt) || inner.state != CallState::Calling {
                return Err(ConversationError::Cancelled);
            }
            inner.conversation_id = Some(conversation_id.clone());
        }
        info!(
            session_id = %self.session_id,
            conversation_id = %conversation_id,
            "outbound call placed"
        );

        match connector.connect(&conversation_id).await {
            Ok(handle) => self.attach(attempt, handle),
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    conversation_id = %conversation_id,
                    "failed to open provider channel: {}",
                    e
                );
                self.fail_attempt(attempt, &format!("Connection error: {}", e));
                Err(e.into())
            }
        }
    }

    fn attach(
        self: &Arc<Self>,
        attempt: u64,
        handle: ChannelHandle,
    ) -> Result<(), ConversationError> {
        let ChannelHandle { channel, events } = handle;
        let mut inner = self.lock();
        if !inner.is_current(attempt) || inner.state != CallState::Calling {
            channel.close();
            return Err(ConversationError::Cancelled);
        }

        let already_open = channel.is_open();
        inner.channel = Some(channel);
        inner.pump = Some(tokio::spawn(Arc::clone(self).pump(attempt, events)));
        if already_open {
            self.activate(&mut inner);
        }
        Ok(())
    }

    async fn pump(self: Arc<Self>, attempt: u64, mut events: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            if !self.on_channel_event(attempt, event) {
                break;
            }
        }
        debug!(session_id = %self.session_id, attempt, "channel pump finished");
    }

    /// Returns `false` once no further events for this attempt matter.
    fn on_channel_event(&self, attempt: u64, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Open => {
                let mut inner = self.lock();
                if !inner.is_current(attempt) {
                    return false;
                }
                self.activate(&mut inner);
                true
            }
            ChannelEvent::Message(message) => self.handle_inbound(attempt, message),
            ChannelEvent::Malformed(detail) => {
                warn!(session_id = %self.session_id, "malformed provider message: {}", detail);
                self.emit(ConversationEvent::Error(format!(
                    "Malformed message from provider: {}",
                    detail
                )));
                true
            }
            ChannelEvent::Closed { code, reason } => {
                info!(
                    session_id = %self.session_id,
                    code,
                    reason = %reason,
                    "provider channel closed"
                );
                self.lose_channel(attempt, CONNECTION_LOST_NOTICE.to_string());
                false
            }
            ChannelEvent::Error(detail) => {
                warn!(session_id = %self.session_id, "provider channel error: {}", detail);
                self.lose_channel(attempt, format!("Connection error: {}", detail));
                false
            }
        }
    }

    fn handle_inbound(&self, attempt: u64, message: InboundMessage) -> bool {
        if let Some(text) = message.relay_text() {
            let mut inner = self.lock();
            if !inner.is_current(attempt) {
                return false;
            }
            if inner.state == CallState::Active {
                self.record(&mut inner, MessageRole::Callee, text);
            } else {
                debug!(
                    session_id = %self.session_id,
                    state = inner.state.as_str(),
                    "dropping provider text outside an active call"
                );
            }
            return true;
        }

        match message {
            InboundMessage::AgentTranscript { .. } | InboundMessage::AgentResponse { .. } => {
                debug!(session_id = %self.session_id, "dropping empty provider text");
                true
            }
            InboundMessage::ConversationEnded => {
                let mut inner = self.lock();
                if inner.is_current(attempt) {
                    info!(session_id = %self.session_id, "provider ended the conversation");
                    self.finish(&mut inner, Some(CALL_ENDED_NOTICE.to_string()), false);
                }
                false
            }
            InboundMessage::Ping => {
                let sender = {
                    let inner = self.lock();
                    if !inner.is_current(attempt) {
                        return false;
                    }
                    inner.channel.as_ref().map(VoiceChannel::sender)
                };
                // Queued without waiting: the transport may itself be
                // waiting on this pump to take the next event.
                if let Some(sender) = sender {
                    if let Err(e) = sender.try_send(OutboundMessage::Pong) {
                        debug!(session_id = %self.session_id, "failed to answer ping: {}", e);
                    }
                }
                true
            }
            InboundMessage::Unknown => {
                debug!(session_id = %self.session_id, "ignoring unrecognised provider message");
                true
            }
        }
    }

    /// Forwards the reporter's text to the dispatcher.
    ///
    /// A failed send is reported to subscribers as an error event and leaves
    /// the conversation running.
    pub async fn send_message(&self, text: &str) -> Result<(), ConversationError> {
        let (sender, conversation_id): (ChannelSender, String) = {
            let inner = self.lock();
            if inner.state != CallState::Active {
                return Err(ConversationError::NotActive);
            }
            let channel = inner
                .channel
                .as_ref()
                .filter(|channel| channel.is_open())
                .ok_or(ConversationError::NotReady)?;
            (
                channel.sender(),
                inner.conversation_id.clone().unwrap_or_default(),
            )
        };

        let update = OutboundMessage::ContextualUpdate {
            text: text.to_string(),
            conversation_id,
        };
        match sender.send(update).await {
            Ok(()) => {
                let mut inner = self.lock();
                inner
                    .messages
                    .push(ChatMessage::now(MessageRole::User, text));
                Ok(())
            }
            Err(VoiceError::NotReady) => Err(ConversationError::NotReady),
            Err(e) => {
                warn!(session_id = %self.session_id, "failed to relay user message: {}", e);
                self.emit(ConversationEvent::Error(format!(
                    "Failed to deliver message: {}",
                    e
                )));
                Err(ConversationError::SendFailed(e.to_string()))
            }
        }
    }

    /// Ends the call. Returns `false` if there was nothing to end.
    pub fn end(&self) -> bool {
        let mut inner = self.lock();
        self.finish(&mut inner, None, false)
    }

    /// Abandons an attempt that is still connecting, releasing the call guard.
    pub fn abandon_if_calling(&self, notice: &str) -> bool {
        let mut inner = self.lock();
        if inner.state != CallState::Calling {
            return false;
        }
        self.finish(&mut inner, Some(notice.to_string()), true)
    }

    /// Waits until the call leaves `Calling` or `timeout` passes, then
    /// returns the state at that point.
    pub async fn wait_until_settled(&self, timeout: Duration) -> CallState {
        let mut state_rx = self.subscribe_state();
        let settled = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state != CallState::Calling),
        )
        .await;
        match settled {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        }
    }

    fn fail_attempt(&self, attempt: u64, notice: &str) {
        let mut inner = self.lock();
        if inner.is_current(attempt) && inner.state == CallState::Calling {
            self.finish(&mut inner, Some(notice.to_string()), true);
        }
    }

    fn lose_channel(&self, attempt: u64, notice: String) {
        let mut inner = self.lock();
        if !inner.is_current(attempt) {
            return;
        }
        match inner.state {
            CallState::Active => {
                self.finish(&mut inner, Some(notice), false);
            }
            CallState::Calling => {
                self.finish(&mut inner, Some(notice), true);
            }
            CallState::Idle | CallState::Ended => {}
        }
    }

    fn activate(&self, inner: &mut Inner) {
        if inner.state != CallState::Calling {
            return;
        }
        inner.state = CallState::Active;
        self.state_tx.send_replace(CallState::Active);
        info!(
            session_id = %self.session_id,
            conversation_id = inner.conversation_id.as_deref().unwrap_or(""),
            "call connected"
        );
    }

    /// Moves to `Ended`, emitting the optional notice and then exactly one
    /// `Ended` event. `release` gives the failed attempt back to the session's
    /// call allowance; the cooldown still applies.
    fn finish(&self, inner: &mut Inner, notice: Option<String>, release: bool) -> bool {
        if matches!(inner.state, CallState::Idle | CallState::Ended) {
            return false;
        }
        let previous = inner.state;
        inner.state = CallState::Ended;
        inner.call_initiated = false;
        if release {
            inner.call_count = inner.call_count.saturating_sub(1);
        }
        if let Some(channel) = inner.channel.take() {
            channel.close();
        }
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }

        if let Some(text) = notice {
            self.record(inner, MessageRole::System, &text);
        }
        self.emit(ConversationEvent::Ended);
        self.state_tx.send_replace(CallState::Ended);
        info!(
            session_id = %self.session_id,
            from = previous.as_str(),
            released = release,
            "call ended"
        );
        true
    }

    fn record(&self, inner: &mut Inner, role: MessageRole, text: &str) {
        let message = ChatMessage::now(role, text);
        inner.messages.push(message.clone());
        self.emit(ConversationEvent::Message(message));
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn record_of(inner: &Inner) -> SessionCallRecord {
    SessionCallRecord {
        is_active: inner.state == CallState::Active,
        call_initiated: inner.call_initiated,
        last_call_at_ms: inner.last_call_at_ms,
        call_count: inner.call_count,
    }
}
