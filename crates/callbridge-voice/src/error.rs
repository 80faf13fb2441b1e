use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// The provider answered with an error.
    #[error("voice provider: {0}")]
    Provider(String),

    #[error("voice provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("voice provider not configured: missing {0}")]
    NotConfigured(String),

    #[error("channel handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("channel is not open")]
    NotReady,

    #[error("malformed provider message: {0}")]
    Protocol(#[from] serde_json::Error),
}
