//! JSON frames exchanged with the provider over the duplex channel.

use crate::error::VoiceError;
use serde::{Deserialize, Serialize};

/// A frame received from the provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Transcribed speech of the person on the phone.
    AgentTranscript {
        #[serde(default)]
        text: String,
    },
    /// A reply produced on the provider side for relay to the reporter.
    AgentResponse {
        #[serde(default)]
        text: String,
    },
    /// The remote side ended the conversation.
    ConversationEnded,
    /// Keep-alive ping; answered with [`OutboundMessage::Pong`].
    Ping,
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Protocol`] when the frame is not a JSON object
    /// with a string `type` field.
    pub fn parse(frame: &str) -> Result<Self, VoiceError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Returns the relayable text, if this frame carries any that is not blank.
    pub fn relay_text(&self) -> Option<&str> {
        match self {
            Self::AgentTranscript { text } | Self::AgentResponse { text } => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            _ => None,
        }
    }
}

/// A frame sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Text typed by the reporter, injected into the call.
    ContextualUpdate {
        text: String,
        conversation_id: String,
    },
    Pong,
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, VoiceError> {
        Ok(serde_json::to_string(self)?)
    }
}
