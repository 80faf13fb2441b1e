//! Shared types, error definitions, and constants for callbridge.
//!
//! This crate provides the foundational types used across the workspace:
//! the emergency report submitted by the intake form, the chat message shape
//! relayed between the phone call and the browser, and the call policy that
//! bounds how often calls may be placed.
//!
//! Neither `callbridge-voice` nor `callbridge-server` defines cross-cutting
//! types of its own; they depend on this crate instead so the dependency
//! graph stays acyclic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod policy;
mod report;

pub use policy::CallPolicy;
pub use report::{
    EmergencyReport, GeoLocation, ValidationError, MAX_DESCRIPTION_CHARS, MAX_MANUAL_ADDRESS_CHARS,
    MIN_DESCRIPTION_CHARS,
};

/// Emergency service the reporter needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Law enforcement.
    Police,
    /// Fire brigade.
    Fire,
    /// Medical emergency.
    Ambulance,
}

impl ServiceType {
    /// Returns the wire label for this service.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Police => "police",
            Self::Fire => "fire",
            Self::Ambulance => "ambulance",
        }
    }

    /// Returns the phrase used when the service is spoken to a dispatcher.
    pub fn spoken(self) -> &'static str {
        match self {
            Self::Police => "the police",
            Self::Fire => "the fire department",
            Self::Ambulance => "an ambulance",
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "police" => Ok(Self::Police),
            "fire" => Ok(Self::Fire),
            "ambulance" => Ok(Self::Ambulance),
            other => Err(ValidationError::UnknownService(other.to_string())),
        }
    }
}

/// Author of a relayed chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The person who filed the report, typing in the browser.
    User,
    /// The dispatcher on the phone, as transcribed by the voice provider.
    Callee,
    /// Status notices generated by the server itself.
    System,
}

/// One entry of a conversation log, also the payload relayed to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Creates a message stamped with the current time.
    pub fn now(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}
