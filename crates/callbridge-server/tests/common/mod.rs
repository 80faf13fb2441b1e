//! Shared fixtures: an isolated `AppState` wired to the loopback provider.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use callbridge_server::conversation::{CallState, Conversation, ConversationEvent};
use callbridge_server::{app, AppState};
use callbridge_types::CallPolicy;
use callbridge_voice::{LoopbackConnector, LoopbackInitiator, LoopbackRemote, VoiceConfig, VoiceMode};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceExt;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub initiator: Arc<LoopbackInitiator>,
    pub remotes: mpsc::UnboundedReceiver<LoopbackRemote>,
}

pub fn loopback_voice() -> VoiceConfig {
    let mut voice = VoiceConfig::default();
    voice.mode = VoiceMode::Loopback;
    voice.connect_timeout_ms = 1_000;
    voice
}

/// Channels open as soon as they are connected.
pub fn test_app(policy: CallPolicy) -> TestApp {
    build(policy, LoopbackInitiator::new(), true)
}

/// Channels stay in the handshake until the test opens the remote end.
pub fn test_app_manual(policy: CallPolicy) -> TestApp {
    build(policy, LoopbackInitiator::new(), false)
}

pub fn test_app_with(policy: CallPolicy, initiator: LoopbackInitiator) -> TestApp {
    build(policy, initiator, true)
}

fn build(policy: CallPolicy, initiator: LoopbackInitiator, auto_open: bool) -> TestApp {
    let initiator = Arc::new(initiator);
    let (connector, remotes) = LoopbackConnector::new(auto_open);
    let state = AppState::with_provider(
        policy,
        &loopback_voice(),
        initiator.clone(),
        Arc::new(connector),
    );
    TestApp {
        router: app(state.clone()),
        state,
        initiator,
        remotes,
    }
}

/// A policy with no cooldown and roomy global limits.
pub fn relaxed_policy() -> CallPolicy {
    CallPolicy {
        max_calls_per_hour: 1_000,
        max_calls_per_minute: 1_000,
        session_cooldown_ms: 0,
        max_calls_per_session: 1_000,
        intake_max_requests: 1_000,
        ..CallPolicy::default()
    }
}

pub fn report_json() -> Value {
    json!({
        "serviceNeeded": "ambulance",
        "description": "My neighbour collapsed and is not responding",
        "manualAddress": "12 Birch Avenue, Flat 3",
        "browserLanguage": "en-GB",
        "timestamp": "2024-05-01T09:30:00Z"
    })
}

pub fn report_for_session(session_id: &str) -> Value {
    let mut report = report_json();
    report["sessionId"] = json!(session_id);
    report
}

pub async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    client_ip: Option<&str>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let mut request = builder.body(body).unwrap();
    if let Some(ip) = client_ip {
        let addr = SocketAddr::new(ip.parse().unwrap(), 40_000);
        request.extensions_mut().insert(ConnectInfo(addr));
    }

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, json)
}

pub async fn submit(router: &Router, body: Value, client_ip: &str) -> (StatusCode, HeaderMap, Value) {
    send(router, "POST", "/api/emergency", Some(body), Some(client_ip)).await
}

pub async fn next_remote(remotes: &mut mpsc::UnboundedReceiver<LoopbackRemote>) -> LoopbackRemote {
    tokio::time::timeout(WAIT, remotes.recv())
        .await
        .expect("a channel should be opened")
        .expect("connector should still be alive")
}

pub async fn next_event(events: &mut broadcast::Receiver<ConversationEvent>) -> ConversationEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event should arrive")
        .expect("event stream should stay open")
}

pub async fn wait_for_state(conversation: &Conversation, wanted: CallState) {
    let mut state = conversation.subscribe_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == wanted))
        .await
        .expect("state should be reached in time")
        .expect("state channel should stay open");
}
