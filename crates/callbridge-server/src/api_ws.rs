//! WebSocket relay between the reporter's browser and a conversation.

use crate::api::validate_user_text;
use crate::conversation::{CallState, Conversation, ConversationEvent};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use callbridge_types::{ChatMessage, MessageRole};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Frames buffered per socket before new ones are dropped.
const SOCKET_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Frames sent by the browser.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingFrame {
    #[serde(rename = "user-message")]
    UserMessage {
        #[serde(rename = "sessionId")]
        session_id: String,
        text: String,
    },
    #[serde(rename = "end-call")]
    EndCall {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Frames sent to the browser.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingFrame {
    Message {
        role: MessageRole,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Ended {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Error {
        message: String,
    },
    Status {
        state: CallState,
    },
}

impl From<ChatMessage> for OutgoingFrame {
    fn from(message: ChatMessage) -> Self {
        OutgoingFrame::Message {
            role: message.role,
            text: message.text,
            timestamp: message.timestamp,
        }
    }
}

/// Handler for `GET /ws?sessionId=...`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let session_id = params.session_id.unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

fn queue_frame(tx: &mpsc::Sender<String>, frame: &OutgoingFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            if let Err(e) = tx.try_send(json) {
                tracing::warn!("dropping WebSocket frame for slow client: {}", e);
            }
        }
        Err(e) => {
            tracing::error!("failed to serialize WebSocket frame: {}", e);
        }
    }
}

fn send_ws_error(tx: &mpsc::Sender<String>, message: String) {
    queue_frame(tx, &OutgoingFrame::Error { message });
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let Some(conversation) = state.registry.get(&session_id) else {
        tracing::info!(session_id = %session_id, "WebSocket for unknown session");
        if let Ok(json) = serde_json::to_string(&OutgoingFrame::Error {
            message: format!("Unknown session: {}", session_id),
        }) {
            let _ = sender.send(AxumMessage::Text(json.into())).await;
        }
        let _ = sender.send(AxumMessage::Close(None)).await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<String>(SOCKET_QUEUE_CAPACITY);

    // Subscribe before reporting state so no event falls in between.
    let events = conversation.subscribe();
    queue_frame(
        &tx,
        &OutgoingFrame::Status {
            state: conversation.state(),
        },
    );

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });
    let mut conversation = conversation;
    let mut relay_task = tokio::spawn(relay_events(events, tx.clone(), session_id.clone()));

    tracing::debug!(session_id = %session_id, "relay socket connected");

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            AxumMessage::Text(text) => {
                // The session may have been ended and reported again since
                // this socket connected.
                let current = state.registry.get(&session_id);
                if let Some(current) = &current {
                    if !Arc::ptr_eq(current, &conversation) {
                        tracing::debug!(session_id = %session_id, "relay socket following new conversation");
                        relay_task.abort();
                        let events = current.subscribe();
                        queue_frame(&tx, &OutgoingFrame::Status { state: current.state() });
                        relay_task = tokio::spawn(relay_events(events, tx.clone(), session_id.clone()));
                        conversation = Arc::clone(current);
                    }
                }
                handle_frame(&state, current.as_deref(), &session_id, &tx, text.as_str()).await;
            }
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }

    relay_task.abort();
    drop(tx);
    let _ = send_task.await;
    tracing::debug!(session_id = %session_id, "relay socket disconnected");
}

async fn relay_events(
    mut events: broadcast::Receiver<ConversationEvent>,
    tx: mpsc::Sender<String>,
    session_id: String,
) {
    loop {
        match events.recv().await {
            Ok(ConversationEvent::Message(message)) => {
                queue_frame(&tx, &OutgoingFrame::from(message));
            }
            Ok(ConversationEvent::Ended) => {
                queue_frame(
                    &tx,
                    &OutgoingFrame::Ended {
                        session_id: session_id.clone(),
                    },
                );
            }
            Ok(ConversationEvent::Error(message)) => send_ws_error(&tx, message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(session_id = %session_id, skipped, "relay subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn handle_frame(
    state: &AppState,
    conversation: Option<&Conversation>,
    session_id: &str,
    tx: &mpsc::Sender<String>,
    text: &str,
) {
    let frame = match serde_json::from_str::<IncomingFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            send_ws_error(tx, format!("Invalid message: {}", e));
            return;
        }
    };

    match frame {
        IncomingFrame::UserMessage {
            session_id: frame_session,
            text,
        } => {
            if frame_session != session_id {
                send_ws_error(tx, "Session mismatch".to_string());
                return;
            }
            let text = match validate_user_text(&text) {
                Ok(text) => text,
                Err(message) => {
                    send_ws_error(tx, message);
                    return;
                }
            };
            let Some(conversation) = conversation else {
                send_ws_error(tx, format!("Unknown session: {}", session_id));
                return;
            };
            if let Err(e) = conversation.send_message(text).await {
                tracing::debug!(session_id, "user message not relayed: {}", e);
                send_ws_error(tx, e.to_string());
            }
        }
        IncomingFrame::EndCall {
            session_id: frame_session,
        } => {
            if frame_session != session_id {
                send_ws_error(tx, "Session mismatch".to_string());
                return;
            }
            tracing::info!(session_id, "reporter ended the call");
            state.registry.remove_conversation(session_id);
        }
    }
}
