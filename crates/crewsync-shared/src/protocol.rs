use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::model::{LocationSample, Message, NotificationEvent, Room};
use crate::types::{CompanyId, Role, RoomId, UserId};

/// Events pushed by the hub to a connected client.
///
/// Frames are JSON text: `{"event": "new-message", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Registration accepted; the channel is live.
    Registered { user_id: UserId },

    /// Registration refused; the session must re-authenticate.
    AuthRejected { reason: String },

    /// The permission set of every session holding `role` changed.
    PermissionInvalidation { role: Role },

    /// A confirmed message was posted to a room the client joined.
    NewMessage { room_id: RoomId, message: Message },

    /// An alert addressed to the user.
    NewNotification(NotificationEvent),

    /// A room became visible to the user (e.g. first message of a new DM).
    NewRoom { room: Room },

    /// A company member moved.
    LocationUpdate(LocationSample),

    /// Number of company members currently connected.
    OnlineCount { count: u64 },
}

/// Events produced by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// First frame on every link.
    RegisterIdentity {
        user_id: UserId,
        company_id: CompanyId,
    },

    /// Start receiving `new-message` for a room.
    JoinRoom { room_id: RoomId },

    /// Fan a confirmed message out to the room's other participants.
    SendMessage { room_id: RoomId, message: Message },

    /// Share the device position with the company.
    UpdateLocation {
        lat: f64,
        lng: f64,
        company_id: CompanyId,
        observed_at: DateTime<Utc>,
    },

    /// Tells the hub the user caught up on `scope`; informational only.
    MarkRead { scope: ReadScope },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReadScope {
    Room(RoomId),
    All,
}

/// Discriminant used to register transport handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Registered,
    AuthRejected,
    PermissionInvalidation,
    NewMessage,
    NewNotification,
    NewRoom,
    LocationUpdate,
    OnlineCount,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Registered { .. } => EventKind::Registered,
            ServerEvent::AuthRejected { .. } => EventKind::AuthRejected,
            ServerEvent::PermissionInvalidation { .. } => EventKind::PermissionInvalidation,
            ServerEvent::NewMessage { .. } => EventKind::NewMessage,
            ServerEvent::NewNotification(_) => EventKind::NewNotification,
            ServerEvent::NewRoom { .. } => EventKind::NewRoom,
            ServerEvent::LocationUpdate(_) => EventKind::LocationUpdate,
            ServerEvent::OnlineCount { .. } => EventKind::OnlineCount,
        }
    }

    /// Serialize to a text frame
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a text frame
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }
}

impl ClientEvent {
    /// Wire name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::RegisterIdentity { .. } => "register-identity",
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::UpdateLocation { .. } => "update-location",
            ClientEvent::MarkRead { .. } => "mark-read",
        }
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }
}
