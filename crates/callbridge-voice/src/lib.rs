//! Voice provider plumbing for callbridge.
//!
//! Two provider operations are wrapped here. The outbound call initiator
//! asks the provider to dial the emergency number and speak a briefing, and
//! the duplex channel carries the dispatcher's transcribed replies back and
//! the reporter's typed text out as contextual updates.
//!
//! Both operations sit behind traits ([`CallInitiator`], [`ChannelConnector`])
//! so the server can run against the real provider, the in-process
//! [`loopback`] provider during development, or scripted doubles in tests.
//!
//! This crate does not carry audio. Speech synthesis and recognition happen
//! on the provider side; only text and lifecycle events cross this boundary.

pub mod briefing;
pub mod channel;
pub mod config;
pub mod error;
pub mod initiator;
pub mod loopback;
pub mod protocol;

pub use briefing::build_briefing;
pub use channel::{
    ChannelConnector, ChannelEvent, ChannelHandle, ChannelSender, ChannelState, VoiceChannel,
    WsChannelConnector,
};
pub use config::{ProviderStatus, VoiceConfig, VoiceMode};
pub use error::VoiceError;
pub use initiator::{CallInitiator, HttpCallInitiator};
pub use loopback::{LoopbackConnector, LoopbackInitiator, LoopbackRemote};
pub use protocol::{InboundMessage, OutboundMessage};
