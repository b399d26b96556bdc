//! Push-channel lifecycle with the tokio command/notification pattern.
//!
//! After the registration handshake, the link is owned by a dedicated
//! tokio task. Callers talk to it through a command channel (`emit`,
//! shutdown) and receive server events through the handler registry.
//! When the link drops, the task reconnects with capped exponential
//! backoff; subscription state on the hub is lost, so owners rejoin
//! their rooms once the state returns to `Connected`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crewsync_shared::constants::{DEFAULT_CONNECT_TIMEOUT_MS, TRANSPORT_COMMAND_CAPACITY};
use crewsync_shared::{ClientEvent, Credential, EventKind, ProtocolError, ServerEvent};

use crate::backoff::Backoff;
use crate::error::TransportError;
use crate::handlers::{HandlerRegistry, SubscriptionId};
use crate::link::{Connector, Link};

// ---------------------------------------------------------------------------
// Configuration / state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on opening the link plus the registration round-trip.
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    /// Give up after this many failed reconnects (`None` = keep trying).
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            backoff: Backoff::default(),
            max_reconnect_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Link lost; `attempt` counts reconnects since the drop.
    Reconnecting { attempt: u32 },
    /// The hub refused the credential.
    Rejected,
}

/// Commands sent *into* the transport task.
#[derive(Debug)]
enum Command {
    Emit(ClientEvent),
    Shutdown,
}

struct Running {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Owner of the single push link of a session.
pub struct Transport {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    handlers: Arc<HandlerRegistry>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<Running>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            config,
            handlers: Arc::new(HandlerRegistry::new()),
            state_tx: Arc::new(state_tx),
            running: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Establish the link and start the transport task.
    ///
    /// A no-op when a link (or a reconnect loop) is already running.
    pub async fn connect(&self, credential: Credential) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;

        if self.is_running() {
            debug!("Transport already running, connect ignored");
            return Ok(());
        }

        self.state_tx.send_replace(ConnectionState::Connecting);

        let link =
            match register_with_timeout(self.connector.as_ref(), &credential, self.config.connect_timeout)
                .await
            {
                Ok(link) => link,
                Err(e) => {
                    let state = match e {
                        TransportError::AuthRejected(_) => ConnectionState::Rejected,
                        _ => ConnectionState::Disconnected,
                    };
                    self.state_tx.send_replace(state);
                    warn!(user = %credential.user_id, error = %e, "Push connect failed");
                    return Err(e);
                }
            };

        info!(user = %credential.user_id, "Push channel connected");
        self.state_tx.send_replace(ConnectionState::Connected);

        let (cmd_tx, cmd_rx) = mpsc::channel(TRANSPORT_COMMAND_CAPACITY);
        let worker = Worker {
            connector: self.connector.clone(),
            credential,
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            state_tx: self.state_tx.clone(),
        };
        let task = tokio::spawn(worker.run(link, cmd_rx));

        if let Ok(mut guard) = self.running.lock() {
            *guard = Some(Running { cmd_tx, task });
        }
        Ok(())
    }

    /// Register a handler; several handlers per kind run in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.handlers.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.unsubscribe(id)
    }

    /// Fire-and-forget send. Events emitted while reconnecting are dropped.
    pub fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        let guard = self.running.lock().map_err(|_| TransportError::NotConnected)?;
        let running = guard.as_ref().ok_or(TransportError::NotConnected)?;
        if running.task.is_finished() {
            return Err(TransportError::NotConnected);
        }
        running
            .cmd_tx
            .try_send(Command::Emit(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Link("transport command queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
            })
    }

    /// Release the link and stop the task. Idempotent.
    pub async fn disconnect(&self) {
        let running = self.running.lock().ok().and_then(|mut guard| guard.take());

        if let Some(running) = running {
            let _ = running.cmd_tx.send(Command::Shutdown).await;
            if let Err(e) = running.task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Transport task ended abnormally");
                }
            }
            info!("Push channel disconnected");
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|guard| {
                guard
                    .as_ref()
                    .map(|running| !running.task.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.running.lock() {
            if let Some(running) = guard.take() {
                running.task.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn register_with_timeout(
    connector: &dyn Connector,
    credential: &Credential,
    timeout: Duration,
) -> Result<Box<dyn Link>, TransportError> {
    match tokio::time::timeout(timeout, register(connector, credential)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Unreachable(format!(
            "no registration answer within {timeout:?}"
        ))),
    }
}

/// Open a link, send `register-identity` and wait for the verdict.
async fn register(
    connector: &dyn Connector,
    credential: &Credential,
) -> Result<Box<dyn Link>, TransportError> {
    let mut link = connector.open(credential).await?;

    let hello = ClientEvent::RegisterIdentity {
        user_id: credential.user_id.clone(),
        company_id: credential.company_id.clone(),
    };
    link.send(hello.to_frame()?).await?;

    let frame = match link.recv().await {
        Some(frame) => frame?,
        None => {
            return Err(TransportError::Unreachable(
                "link closed during registration".into(),
            ))
        }
    };

    match ServerEvent::from_frame(&frame)? {
        ServerEvent::Registered { .. } => Ok(link),
        ServerEvent::AuthRejected { reason } => {
            link.close().await;
            Err(TransportError::AuthRejected(reason))
        }
        other => {
            link.close().await;
            Err(ProtocolError::UnexpectedEvent {
                stage: "registration",
                event: format!("{:?}", other.kind()),
            }
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

enum Pump {
    Shutdown,
    Dropped(String),
    Rejected(String),
}

struct Worker {
    connector: Arc<dyn Connector>,
    credential: Credential,
    config: TransportConfig,
    handlers: Arc<HandlerRegistry>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
}

impl Worker {
    async fn run(self, mut link: Box<dyn Link>, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            match self.pump(&mut link, &mut cmd_rx).await {
                Pump::Shutdown => {
                    link.close().await;
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    info!("Transport task shut down");
                    return;
                }
                Pump::Rejected(reason) => {
                    link.close().await;
                    warn!(reason = %reason, "Hub revoked the session");
                    self.state_tx.send_replace(ConnectionState::Rejected);
                    return;
                }
                Pump::Dropped(reason) => {
                    warn!(reason = %reason, "Push link dropped");
                    link.close().await;
                }
            }

            match self.reconnect(&mut cmd_rx).await {
                Some(new_link) => {
                    link = new_link;
                    info!(user = %self.credential.user_id, "Push link re-established");
                    self.state_tx.send_replace(ConnectionState::Connected);
                }
                None => return,
            }
        }
    }

    /// Move frames in both directions until the link ends.
    async fn pump(&self, link: &mut Box<dyn Link>, cmd_rx: &mut mpsc::Receiver<Command>) -> Pump {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Emit(event)) => {
                        let frame = match event.to_frame() {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(event = event.name(), error = %e, "Failed to encode event");
                                continue;
                            }
                        };
                        if let Err(e) = link.send(frame).await {
                            return Pump::Dropped(e.to_string());
                        }
                        debug!(event = event.name(), "Event emitted");
                    }
                    Some(Command::Shutdown) | None => return Pump::Shutdown,
                },

                frame = link.recv() => match frame {
                    Some(Ok(text)) => {
                        let event = match ServerEvent::from_frame(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(error = %e, "Dropping undecodable frame");
                                continue;
                            }
                        };
                        let rejection = match &event {
                            ServerEvent::AuthRejected { reason } => Some(reason.clone()),
                            _ => None,
                        };
                        self.handlers.dispatch(&event);
                        if let Some(reason) = rejection {
                            return Pump::Rejected(reason);
                        }
                    }
                    Some(Err(e)) => return Pump::Dropped(e.to_string()),
                    None => return Pump::Dropped("closed by hub".into()),
                },
            }
        }
    }

    /// Retry the handshake with backoff. `None` means the task must end.
    async fn reconnect(&self, cmd_rx: &mut mpsc::Receiver<Command>) -> Option<Box<dyn Link>> {
        let mut attempt: u32 = 0;

        loop {
            if let Some(max) = self.config.max_reconnect_attempts {
                if attempt >= max {
                    warn!(attempts = attempt, "Giving up on the push channel");
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    return None;
                }
            }

            self.state_tx
                .send_replace(ConnectionState::Reconnecting { attempt: attempt + 1 });
            let delay = self.config.backoff.delay(attempt);
            debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = drain_until_shutdown(cmd_rx) => {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    return None;
                }
            }

            let outcome = tokio::select! {
                result = register_with_timeout(
                    self.connector.as_ref(),
                    &self.credential,
                    self.config.connect_timeout,
                ) => result,
                _ = drain_until_shutdown(cmd_rx) => {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    return None;
                }
            };

            match outcome {
                Ok(link) => return Some(link),
                Err(TransportError::AuthRejected(reason)) => {
                    warn!(reason = %reason, "Reconnect rejected by hub");
                    self.state_tx.send_replace(ConnectionState::Rejected);
                    self.handlers.dispatch(&ServerEvent::AuthRejected { reason });
                    return None;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    }
}

/// Swallow emits until a shutdown arrives (or every sender is gone).
async fn drain_until_shutdown(cmd_rx: &mut mpsc::Receiver<Command>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Emit(event) => {
                debug!(event = event.name(), "Dropping emit while reconnecting")
            }
            Command::Shutdown => return,
        }
    }
}
