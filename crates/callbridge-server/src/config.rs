//! Server configuration loading from file and environment variables.

use callbridge_types::CallPolicy;
use callbridge_voice::{VoiceConfig, VoiceMode};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Voice provider credentials and channel timings.
    #[serde(default)]
    pub voice: VoiceConfig,

    /// Call admission and intake limits.
    #[serde(default)]
    pub policy: CallPolicy,

    /// Shutdown behaviour.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "callbridge_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Delay after ending all calls before the process exits, in milliseconds.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_grace_ms() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CALLBRIDGE_HOST` overrides `server.host`
/// - `CALLBRIDGE_PORT` overrides `server.port`
/// - `CALLBRIDGE_LOG_LEVEL` overrides `logging.level`
/// - `CALLBRIDGE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `CALLBRIDGE_VOICE_MODE` overrides `voice.mode` ("live" or "loopback")
/// - `CALLBRIDGE_API_KEY`, `CALLBRIDGE_AGENT_ID`, `CALLBRIDGE_PHONE_NUMBER_ID`
///   and `CALLBRIDGE_DESTINATION_NUMBER` override the provider credentials
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides<F>(config: &mut Config, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = var("CALLBRIDGE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("CALLBRIDGE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = var("CALLBRIDGE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("CALLBRIDGE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(mode) = var("CALLBRIDGE_VOICE_MODE") {
        match mode.trim().to_ascii_lowercase().as_str() {
            "live" => config.voice.mode = VoiceMode::Live,
            "loopback" => config.voice.mode = VoiceMode::Loopback,
            other => tracing::warn!(mode = other, "ignoring unknown CALLBRIDGE_VOICE_MODE"),
        }
    }
    if let Some(key) = var("CALLBRIDGE_API_KEY") {
        config.voice.api_key = key;
    }
    if let Some(agent) = var("CALLBRIDGE_AGENT_ID") {
        config.voice.agent_id = agent;
    }
    if let Some(phone) = var("CALLBRIDGE_PHONE_NUMBER_ID") {
        config.voice.phone_number_id = phone;
    }
    if let Some(destination) = var("CALLBRIDGE_DESTINATION_NUMBER") {
        config.voice.destination_number = destination;
    }
}
