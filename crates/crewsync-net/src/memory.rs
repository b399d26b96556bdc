//! In-memory loopback connector.
//!
//! [`MemoryConnector::pair`] returns the client-side connector together
//! with a [`MemoryServer`] that receives one [`MemoryPeer`] per accepted
//! link. Tests play the hub through the peer; embedding applications can
//! use it to run a client against an in-process hub.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crewsync_shared::{ClientEvent, Credential, ServerEvent};

use crate::error::TransportError;
use crate::link::{Connector, Link};

/// How the connector answers the next `open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryMode {
    Accept,
    Reject(String),
    Unreachable,
}

pub struct MemoryConnector {
    mode: Mutex<MemoryMode>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Hub side of one loopback link.
pub struct MemoryPeer {
    pub credential: Credential,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                mode: Mutex::new(MemoryMode::Accept),
                accept_tx,
            },
            MemoryServer { accept_rx },
        )
    }

    pub fn set_mode(&self, mode: MemoryMode) {
        if let Ok(mut guard) = self.mode.lock() {
            *guard = mode;
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, credential: &Credential) -> Result<Box<dyn Link>, TransportError> {
        let mode = self
            .mode
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(MemoryMode::Unreachable);

        match mode {
            MemoryMode::Reject(reason) => return Err(TransportError::AuthRejected(reason)),
            MemoryMode::Unreachable => {
                return Err(TransportError::Unreachable("loopback offline".into()))
            }
            MemoryMode::Accept => {}
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            credential: credential.clone(),
            to_client,
            from_client,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::Unreachable("loopback server dropped".into()))?;

        Ok(Box::new(MemoryLink {
            tx: Some(client_tx),
            rx: client_rx,
        }))
    }
}

impl MemoryServer {
    /// Wait for the next link opened by the client.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

impl MemoryPeer {
    /// Next event produced by the client; `None` once it closed the link.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            let frame = self.from_client.recv().await?;
            match ClientEvent::from_frame(&frame) {
                Ok(event) => return Some(event),
                Err(e) => debug!(error = %e, "Loopback peer dropped undecodable frame"),
            }
        }
    }

    /// Push an event to the client. Returns `false` if the client is gone.
    pub fn send(&self, event: &ServerEvent) -> bool {
        match event.to_frame() {
            Ok(frame) => self.to_client.send(frame).is_ok(),
            Err(_) => false,
        }
    }

    /// Read `register-identity` and answer `registered`.
    pub async fn complete_handshake(&mut self) -> Option<ClientEvent> {
        let first = self.recv().await?;
        if let ClientEvent::RegisterIdentity { user_id, .. } = &first {
            self.send(&ServerEvent::Registered {
                user_id: user_id.clone(),
            });
        }
        Some(first)
    }
}

struct MemoryLink {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(frame)
            .map_err(|_| TransportError::Link("loopback peer closed".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
