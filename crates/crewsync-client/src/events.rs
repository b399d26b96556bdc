//! Events published to the UI layer.
//!
//! Every component publishes through the same [`EventBus`]; a slow
//! subscriber lags and skips events instead of blocking the core.

use serde::Serialize;
use tokio::sync::broadcast;

use crewsync_net::ConnectionState;
use crewsync_shared::constants::UI_EVENT_CAPACITY;
use crewsync_shared::{LocationSample, Message, NotificationEvent, Session, RoomId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum UiEvent {
    /// Drives the non-blocking "reconnecting" indicator.
    ConnectionChanged(ConnectionState),
    /// Credential refused; the user has to sign in again.
    AuthRequired { reason: String },
    /// A send was rolled back. `message` is the failed entry, in FAILED state.
    SendFailed {
        room_id: RoomId,
        message: Message,
        reason: String,
    },
    LogChanged { room_id: RoomId },
    RoomsChanged,
    UnreadChanged { room_id: RoomId, count: u32 },
    /// New alert-feed entry; also the audible/visual cue.
    Alert(NotificationEvent),
    OnlineCount { count: u64 },
    PermissionsChanged(Session),
    RefreshFailed { reason: String },
    LocationChanged(LocationSample),
}

impl UiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UiEvent::ConnectionChanged(_) => "connection-changed",
            UiEvent::AuthRequired { .. } => "auth-required",
            UiEvent::SendFailed { .. } => "send-failed",
            UiEvent::LogChanged { .. } => "log-changed",
            UiEvent::RoomsChanged => "rooms-changed",
            UiEvent::UnreadChanged { .. } => "unread-changed",
            UiEvent::Alert(_) => "alert",
            UiEvent::OnlineCount { .. } => "online-count",
            UiEvent::PermissionsChanged(_) => "permissions-changed",
            UiEvent::RefreshFailed { .. } => "refresh-failed",
            UiEvent::LocationChanged(_) => "location-changed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UI_EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: UiEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "No UI subscriber");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
