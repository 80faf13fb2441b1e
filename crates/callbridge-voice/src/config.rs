use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

fn default_api_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}

fn default_ws_url() -> String {
    "wss://api.elevenlabs.io/v1/convai/conversation".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    20_000
}

/// Which provider implementation the server wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceMode {
    /// Dial through the configured voice provider.
    #[default]
    Live,
    /// Simulate the provider in-process; no call is placed.
    Loopback,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub mode: VoiceMode,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub phone_number_id: String,
    /// Number dialled for every report. Fixed per deployment.
    #[serde(default)]
    pub destination_number: String,
    /// Channel handshake timeout. Default: 15 s.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Keep-alive ping interval on an open channel. Default: 30 s.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Timeout of the outbound-call HTTP request. Default: 20 s.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            mode: VoiceMode::default(),
            api_base_url: default_api_base_url(),
            ws_url: default_ws_url(),
            api_key: String::new(),
            agent_id: String::new(),
            phone_number_id: String::new(),
            destination_number: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl fmt::Debug for VoiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceConfig")
            .field("mode", &self.mode)
            .field("api_base_url", &self.api_base_url)
            .field("ws_url", &self.ws_url)
            .field("api_key", &"[REDACTED]")
            .field("agent_id", &self.agent_id)
            .field("phone_number_id", &self.phone_number_id)
            .field("destination_number", &"[REDACTED]")
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("ping_interval_ms", &self.ping_interval_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

/// Which provider settings are present, without their values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub configured: bool,
    pub api_key_configured: bool,
    pub agent_id_configured: bool,
    pub phone_number_configured: bool,
    pub destination_configured: bool,
}

impl VoiceConfig {
    pub fn new(
        api_key: impl Into<String>,
        agent_id: impl Into<String>,
        phone_number_id: impl Into<String>,
        destination_number: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            agent_id: agent_id.into(),
            phone_number_id: phone_number_id.into(),
            destination_number: destination_number.into(),
            ..Self::default()
        }
    }

    pub fn status(&self) -> ProviderStatus {
        let api_key_configured = !self.api_key.trim().is_empty();
        let agent_id_configured = !self.agent_id.trim().is_empty();
        let phone_number_configured = !self.phone_number_id.trim().is_empty();
        let destination_configured = !self.destination_number.trim().is_empty();
        ProviderStatus {
            configured: self.mode == VoiceMode::Loopback
                || (api_key_configured
                    && agent_id_configured
                    && phone_number_configured
                    && destination_configured),
            api_key_configured,
            agent_id_configured,
            phone_number_configured,
            destination_configured,
        }
    }

    /// Names of the settings a live call still needs.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let status = self.status();
        let mut missing = Vec::new();
        if !status.api_key_configured {
            missing.push("api_key");
        }
        if !status.agent_id_configured {
            missing.push("agent_id");
        }
        if !status.phone_number_configured {
            missing.push("phone_number_id");
        }
        if !status.destination_configured {
            missing.push("destination_number");
        }
        missing
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
