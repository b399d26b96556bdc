use thiserror::Error;

/// Errors raised while encoding or decoding push-channel frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown role tag: {0}")]
    UnknownRole(String),

    #[error("Unexpected event during {stage}: {event}")]
    UnexpectedEvent { stage: &'static str, event: String },
}
