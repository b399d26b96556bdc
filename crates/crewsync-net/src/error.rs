use thiserror::Error;

use crewsync_shared::ProtocolError;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The credential was refused; the session must re-authenticate.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// The endpoint could not be reached in time.
    #[error("Push endpoint unreachable: {0}")]
    Unreachable(String),

    /// `emit` was called with no live link.
    #[error("Not connected")]
    NotConnected,

    /// The live link failed mid-stream.
    #[error("Link error: {0}")]
    Link(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether another connection attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::AuthRejected(_))
    }
}
