use thiserror::Error;

use crewsync_net::TransportError;
use crewsync_shared::{Draft, TempId};
use crewsync_store::StoreError;

/// Failure of a collaborator HTTP service call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Credential refused by service")]
    Unauthorized,

    #[error("Service answered HTTP {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Request timed out")]
    Timeout,
}

/// Errors surfaced by the sync core.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Credential invalid. Fatal to the session, forces re-login.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// The push channel could not be established; retried with backoff.
    #[error("Push channel unreachable: {0}")]
    Unreachable(String),

    /// Permission refresh failed; last-known permissions stay in effect.
    #[error("Permission refresh failed: {0}")]
    RefreshFailed(String),

    /// The message was not accepted. `draft` holds the user's input so the
    /// composer can be restored.
    #[error("Message send failed: {reason}")]
    SendFailed { reason: String, draft: Draft },

    /// A confirmation referenced a temporary id that is no longer pending.
    #[error("No pending message for {0}")]
    StaleReconcile(TempId),

    #[error("No active session")]
    NoSession,

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Everything except a refused credential or a missing session can be
    /// shown as transient, dismissible feedback.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SyncError::AuthRejected(_) | SyncError::NoSession)
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthRejected(reason) => SyncError::AuthRejected(reason),
            other => SyncError::Unreachable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
