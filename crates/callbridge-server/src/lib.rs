//! Callbridge server library logic.

pub mod admission;
pub mod api;
pub mod api_ws;
pub mod config;
pub mod conversation;
pub mod middleware;
pub mod rate_limit;
pub mod registry;
pub mod shutdown;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use callbridge_types::CallPolicy;
use callbridge_voice::{
    CallInitiator, ChannelConnector, HttpCallInitiator, LoopbackConnector, LoopbackInitiator,
    ProviderStatus, VoiceConfig, VoiceError, VoiceMode, WsChannelConnector,
};
use rate_limit::RateLimiter;
use registry::SessionRegistry;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live conversations and the admission ledger.
    pub registry: SessionRegistry,
    /// Report intake limiter.
    pub rate_limiter: RateLimiter,
    /// Places outbound calls.
    pub initiator: Arc<dyn CallInitiator>,
    /// Opens provider channels.
    pub connector: Arc<dyn ChannelConnector>,
    /// Which provider settings are present.
    pub voice_status: ProviderStatus,
    /// How long intake waits for a placed call to connect.
    pub call_settle_timeout: Duration,
}

/// Slack beyond the channel handshake timeout; a stalled handshake is ended
/// by the channel's own timeout first.
const SETTLE_MARGIN: Duration = Duration::from_secs(1);

impl AppState {
    /// Builds state around an explicit provider.
    pub fn with_provider(
        policy: CallPolicy,
        voice: &VoiceConfig,
        initiator: Arc<dyn CallInitiator>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(policy),
            rate_limiter: RateLimiter::new(),
            initiator,
            connector,
            voice_status: voice.status(),
            call_settle_timeout: voice.connect_timeout() + SETTLE_MARGIN,
        }
    }

    /// Builds state with the provider selected by `voice.mode`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Http`] if the provider HTTP client cannot be built.
    pub fn from_config(config: &config::Config) -> Result<Self, VoiceError> {
        let (initiator, connector): (Arc<dyn CallInitiator>, Arc<dyn ChannelConnector>) =
            match config.voice.mode {
                VoiceMode::Live => {
                    let missing = config.voice.missing_settings();
                    if !missing.is_empty() {
                        tracing::warn!(
                            missing = %missing.join(", "),
                            "voice provider is not fully configured, calls will fall back"
                        );
                    }
                    (
                        Arc::new(HttpCallInitiator::new(config.voice.clone())?),
                        Arc::new(WsChannelConnector::new(config.voice.clone())),
                    )
                }
                VoiceMode::Loopback => {
                    tracing::warn!("voice provider in loopback mode, no real calls are placed");
                    (
                        Arc::new(LoopbackInitiator::new()),
                        Arc::new(LoopbackConnector::simulated()),
                    )
                }
            };
        Ok(Self::with_provider(
            config.policy.clone(),
            &config.voice,
            initiator,
            connector,
        ))
    }
}

/// Locks `mutex`, accepting the guard of a poisoned lock.
///
/// Every structure guarded this way stays usable after a panic elsewhere; the
/// worst outcome is a stale counter or log entry.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("{} lock poisoned, recovering with stale state", what);
            poisoned.into_inner()
        }
    }
}

/// Current time in Unix milliseconds.
pub(crate) fn unix_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Converts a wait in milliseconds to whole seconds, rounded up, at least one.
pub(crate) fn millis_to_retry_secs(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}

/// Maximum request body size (64 KiB). Reports and relayed messages are small.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/emergency", post(api::submit_report_handler))
        .route("/api/status", get(api::status_handler))
        .route("/api/sessions/{sessionId}", get(api::get_session_handler))
        .route(
            "/api/sessions/{sessionId}/messages",
            post(api::relay_message_handler),
        )
        .route("/api/sessions/{sessionId}/end", post(api::end_call_handler))
        .route(
            "/api/sessions/{sessionId}/admission",
            get(api::admission_handler),
        )
        .route("/ws", get(api_ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(
            middleware::client_identity_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
