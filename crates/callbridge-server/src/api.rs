//! HTTP handlers for report intake and session control.

use crate::admission::{AdmissionDecision, AdmissionRejection};
use crate::conversation::{CallState, Conversation, ConversationError, ConversationSnapshot};
use crate::middleware::ClientIdentity;
use crate::rate_limit::RateLimitDecision;
use crate::registry::{is_valid_session_id, new_session_id};
use crate::{millis_to_retry_secs, unix_millis, AppState};
use axum::{
    extract::{rejection::JsonRejection, Path},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use callbridge_types::EmergencyReport;
use callbridge_voice::ProviderStatus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Longest message a reporter may relay in one go, in characters.
pub const MAX_USER_MESSAGE_CHARS: usize = 1000;

const CALL_TIMEOUT_NOTICE: &str = "Call did not connect in time";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("too many requests")]
    RateLimited(RateLimitDecision),
    #[error("call refused: {0}")]
    Rejected(#[from] AdmissionRejection),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl From<ConversationError> for ApiError {
    fn from(err: ConversationError) -> Self {
        match err {
            ConversationError::NotActive | ConversationError::Cancelled => {
                ApiError::Conflict(err.to_string())
            }
            ConversationError::NotReady => ApiError::ServiceUnavailable(err.to_string()),
            ConversationError::SendFailed(_) | ConversationError::Provider(_) => {
                ApiError::BadGateway(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::RateLimited(decision) => return rate_limited_response(&decision),
            ApiError::Rejected(rejection) => return rejected_response(rejection),
        };

        let body = Json(json!({
            "success": false,
            "error": message
        }));

        (status, body).into_response()
    }
}

fn rate_limited_response(decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after_secs(unix_millis());
    let body = Json(json!({
        "success": false,
        "allowed": false,
        "error": "Too many requests. Please try again later.",
        "retryAfter": retry_after,
        "remaining": 0,
        "limit": decision.limit,
        "resetTime": decision.reset_time_ms,
    }));
    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    insert_rate_limit_headers(headers, decision);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn rejected_response(rejection: AdmissionRejection) -> Response {
    let reason = rejection.to_string();
    let retry_after = rejection.retry_after_ms().map(millis_to_retry_secs);
    let mut body = json!({
        "success": false,
        "allowed": false,
        "error": reason,
        "reason": reason,
    });
    if let Some(secs) = retry_after {
        body["retryAfter"] = json!(secs);
    }
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

/// `X-RateLimit-Reset` is in Unix seconds.
fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(decision.reset_time_ms.div_ceil(1000)),
    );
}

/// Body of `POST /api/emergency`.
#[derive(Debug, Deserialize)]
pub struct SubmitReportRequest {
    #[serde(flatten)]
    pub report: EmergencyReport,
    /// Reuses an existing session instead of starting a new one.
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiCallStatus {
    Active,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReportResponse {
    pub success: bool,
    pub session_id: String,
    pub ai_call_status: AiCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handler for `POST /api/emergency`.
///
/// Validates the report, applies the per-client intake limit, admits the
/// session and places the call. A call that fails to connect still answers
/// 200 with `aiCallStatus: "failed"` so the client can fall back.
pub async fn submit_report_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    payload: Result<Json<SubmitReportRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    request
        .report
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let policy = state.registry.policy();
    let limit = state.rate_limiter.check_rate_limit(
        &identity.0,
        policy.intake_max_requests,
        Duration::from_millis(policy.intake_window_ms),
    );
    if !limit.allowed {
        tracing::warn!(client = %identity.0, "report intake rate limit exceeded");
        return Err(ApiError::RateLimited(limit));
    }

    let session_id = match request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        Some(id) if is_valid_session_id(id) => id.to_string(),
        Some(_) => return Err(ApiError::BadRequest("invalid sessionId".to_string())),
        None => new_session_id(),
    };

    let conversation = state.registry.admit(&session_id).map_err(|rejection| {
        tracing::info!(session_id = %session_id, reason = %rejection, "call refused");
        ApiError::from(rejection)
    })?;
    tracing::info!(
        session_id = %session_id,
        service = request.report.service_needed.as_str(),
        "report admitted, placing call"
    );

    let body = match place_call(&state, conversation, request.report).await {
        Ok(()) => SubmitReportResponse {
            success: true,
            session_id,
            ai_call_status: AiCallStatus::Active,
            fallback_mode: None,
            error: None,
        },
        Err(message) => {
            tracing::warn!(session_id = %session_id, "call failed, client falls back: {}", message);
            SubmitReportResponse {
                success: true,
                session_id,
                ai_call_status: AiCallStatus::Failed,
                fallback_mode: Some(true),
                error: Some(message),
            }
        }
    };

    let mut response = Json(body).into_response();
    insert_rate_limit_headers(response.headers_mut(), &limit);
    Ok(response)
}

/// Places the call and waits for the channel to open.
async fn place_call(
    state: &AppState,
    conversation: Arc<Conversation>,
    report: EmergencyReport,
) -> Result<(), String> {
    let initiator = Arc::clone(&state.initiator);
    let connector = Arc::clone(&state.connector);
    let settle_timeout = state.call_settle_timeout;

    // Runs detached: setup must complete even if the client disconnects.
    let setup = tokio::spawn(async move {
        if let Err(e) = conversation
            .begin_call(&report, initiator.as_ref(), connector.as_ref())
            .await
        {
            return Err(e.to_string());
        }

        match conversation.wait_until_settled(settle_timeout).await {
            CallState::Active => Ok(()),
            CallState::Calling => {
                conversation.abandon_if_calling(CALL_TIMEOUT_NOTICE);
                Err(CALL_TIMEOUT_NOTICE.to_string())
            }
            CallState::Idle | CallState::Ended => {
                Err("Call ended before it connected".to_string())
            }
        }
    });

    setup
        .await
        .map_err(|e| format!("call setup task failed: {}", e))?
}

/// Body of `POST /api/sessions/{sessionId}/messages`.
#[derive(Debug, Deserialize)]
pub struct RelayMessageRequest {
    pub text: String,
}

/// Handler for `POST /api/sessions/{sessionId}/messages`.
pub async fn relay_message_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
    payload: Result<Json<RelayMessageRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let text = validate_user_text(&request.text).map_err(ApiError::BadRequest)?;

    let conversation = state
        .registry
        .get(&session_id)
        .ok_or_else(|| ApiError::NotFound(format!("session {}", session_id)))?;
    conversation.send_message(text).await?;

    Ok(Json(json!({ "success": true })))
}

/// Trims the reporter's text and checks it is relayable.
pub(crate) fn validate_user_text(text: &str) -> Result<&str, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("message text is required".to_string());
    }
    if text.chars().count() > MAX_USER_MESSAGE_CHARS {
        return Err(format!(
            "message exceeds maximum length of {} characters",
            MAX_USER_MESSAGE_CHARS
        ));
    }
    Ok(text)
}

/// Handler for `POST /api/sessions/{sessionId}/end`.
pub async fn end_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    let ended = state.registry.remove_conversation(&session_id);
    Json(json!({ "success": true, "ended": ended }))
}

/// Handler for `GET /api/sessions/{sessionId}`.
pub async fn get_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ConversationSnapshot>, ApiError> {
    state
        .registry
        .get(&session_id)
        .map(|conversation| Json(conversation.snapshot()))
        .ok_or_else(|| ApiError::NotFound(format!("session {}", session_id)))
}

/// Handler for `GET /api/sessions/{sessionId}/admission`.
pub async fn admission_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<AdmissionDecision> {
    Json(state.registry.can_initiate_call(&session_id))
}

/// Handler for `GET /api/status`.
///
/// Reports which provider settings are present, never their values.
pub async fn status_handler(Extension(state): Extension<Arc<AppState>>) -> Json<ProviderStatus> {
    Json(state.voice_status)
}
