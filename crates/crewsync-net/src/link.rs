//! Connector / link seam.
//!
//! A [`Connector`] opens an authenticated [`Link`] carrying JSON text
//! frames. The transport owns exactly one link at a time and never looks
//! at what carries the frames, so the WebSocket connector and the
//! in-memory loopback are interchangeable.

use async_trait::async_trait;

use crewsync_shared::Credential;

use crate::error::TransportError;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link, presenting the bearer credential.
    ///
    /// Returns `AuthRejected` when the endpoint refuses the credential and
    /// `Unreachable` when it cannot be reached.
    async fn open(&self, credential: &Credential) -> Result<Box<dyn Link>, TransportError>;
}

#[async_trait]
pub trait Link: Send {
    /// Write one frame.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the remote side closed the link.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the link. Safe to call more than once.
    async fn close(&mut self);
}
