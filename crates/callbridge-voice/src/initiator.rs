//! Outbound call initiation.

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use callbridge_types::EmergencyReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Places outbound calls through a voice provider.
#[async_trait]
pub trait CallInitiator: Send + Sync {
    /// Dials the configured destination and has the provider speak `briefing`.
    ///
    /// Returns the provider's opaque conversation identifier.
    async fn initiate(
        &self,
        report: &EmergencyReport,
        briefing: &str,
    ) -> Result<String, VoiceError>;
}

#[derive(Debug, Serialize)]
struct OutboundCallRequest<'a> {
    agent_id: &'a str,
    agent_phone_number_id: &'a str,
    to_number: &'a str,
    conversation_initiation_client_data: ClientData<'a>,
}

#[derive(Debug, Serialize)]
struct ClientData<'a> {
    dynamic_variables: DynamicVariables<'a>,
}

#[derive(Debug, Serialize)]
struct DynamicVariables<'a> {
    emergency_briefing: &'a str,
    service_needed: &'a str,
    location: String,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct OutboundCallResponse {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default, rename = "callSid")]
    call_sid: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP implementation of [`CallInitiator`].
#[derive(Debug, Clone)]
pub struct HttpCallInitiator {
    client: reqwest::Client,
    config: VoiceConfig,
}

impl HttpCallInitiator {
    /// # Errors
    ///
    /// Returns [`VoiceError::Http`] if the HTTP client cannot be built.
    pub fn new(config: VoiceConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/convai/twilio/outbound-call",
            self.config.api_base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl CallInitiator for HttpCallInitiator {
    async fn initiate(
        &self,
        report: &EmergencyReport,
        briefing: &str,
    ) -> Result<String, VoiceError> {
        let missing = self.config.missing_settings();
        if !missing.is_empty() {
            return Err(VoiceError::NotConfigured(missing.join(", ")));
        }

        let location = match (report.address(), report.location.as_ref()) {
            (Some(address), _) => address.to_string(),
            (None, Some(loc)) => format!("{:.5}, {:.5}", loc.latitude, loc.longitude),
            (None, None) => String::new(),
        };
        let body = OutboundCallRequest {
            agent_id: &self.config.agent_id,
            agent_phone_number_id: &self.config.phone_number_id,
            to_number: &self.config.destination_number,
            conversation_initiation_client_data: ClientData {
                dynamic_variables: DynamicVariables {
                    emergency_briefing: briefing,
                    service_needed: report.service_needed.as_str(),
                    location,
                    language: &report.browser_language,
                },
            },
        };

        info!(
            service = report.service_needed.as_str(),
            briefing_len = briefing.len(),
            "requesting outbound call"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("xi-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = provider_error_message(&text)
                .unwrap_or_else(|| format!("outbound call failed with status {}", status));
            warn!(status = status.as_u16(), "outbound call rejected: {}", message);
            return Err(VoiceError::Provider(message));
        }

        let parsed: OutboundCallResponse = serde_json::from_str(&text)?;
        parsed
            .conversation_id
            .or(parsed.call_sid)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                VoiceError::Provider(
                    parsed
                        .message
                        .unwrap_or_else(|| "response did not include a conversation id".to_string()),
                )
            })
    }
}

/// Pulls a human-readable message out of a provider error body.
///
/// Providers report errors as `{"detail": "..."}`,
/// `{"detail": {"message": "..."}}`, `{"message": "..."}` or
/// `{"error": "..."}`.
fn provider_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let candidates = [
        value.get("detail").and_then(Value::as_str),
        value
            .get("detail")
            .and_then(|d| d.get("message"))
            .and_then(Value::as_str),
        value.get("message").and_then(Value::as_str),
        value.get("error").and_then(Value::as_str),
    ];
    let found = candidates
        .into_iter()
        .flatten()
        .find(|m| !m.trim().is_empty())
        .map(str::to_string);
    found
}
