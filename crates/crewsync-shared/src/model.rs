//! Data model kept consistent across clients by the push channel.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can travel over
//! the wire, through the collaborator HTTP services and into the local store
//! unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    CompanyId, MessageId, NotificationId, PermissionSet, Role, RoomId, TempId, UserId,
};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Identity and permission set of the signed-in user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub company_id: CompanyId,
    pub permissions: PermissionSet,
}

/// Result of an explicit login against the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResult {
    pub session: Session,
    /// Bearer token used for the push channel and every HTTP service.
    pub token: String,
}

/// Local, non-authoritative edits to the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    pub display_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomKind {
    Direct,
    ProjectGroup,
    Internal,
    AdminClient,
    AdminSub,
    SubClient,
}

/// Short preview of the most recent message in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageSummary {
    pub sender_display: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation scope owning an ordered message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub kind: RoomKind,
    /// A client participates (project groups).
    #[serde(default)]
    pub has_client: bool,
    /// A subcontractor participates (project groups).
    #[serde(default)]
    pub has_sub: bool,
    /// Role of the other party in a DIRECT room.
    #[serde(default)]
    pub other_role: Option<Role>,
    pub display_name: String,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub last_message: Option<MessageSummary>,
    #[serde(default)]
    pub unread_count: u32,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// What the user typed into the composer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Draft {
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Draft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            attachments: Vec::new(),
        }
    }
}

/// Request body sent to the message persistence service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub client_temp_id: TempId,
}

/// A single chat message, optimistic or confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned id; `None` while pending.
    #[serde(default)]
    pub id: Option<MessageId>,
    /// Present on the sender's own copy only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<TempId>,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_display: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "confirmed")]
    pub delivery_state: DeliveryState,
}

fn confirmed() -> DeliveryState {
    DeliveryState::Confirmed
}

impl Message {
    /// Build the optimistic echo of a local send.
    pub fn pending(
        room_id: RoomId,
        sender_id: UserId,
        sender_display: String,
        draft: Draft,
        temp_id: TempId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            client_temp_id: Some(temp_id),
            room_id,
            sender_id,
            sender_display,
            body: draft.body,
            attachments: draft.attachments,
            created_at,
            delivery_state: DeliveryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            sender_display: self.sender_display.clone(),
            body: self.body.clone(),
            created_at: self.created_at,
        }
    }

    /// Recover the composer contents from a message.
    pub fn to_draft(&self) -> Draft {
        Draft {
            body: self.body.clone(),
            attachments: self.attachments.clone(),
        }
    }

    /// Copy with the sender-only temporary id removed.
    pub fn without_temp_id(&self) -> Self {
        Self {
            client_temp_id: None,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Ephemeral position report; each sample supersedes the previous one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationSample {
    pub user_id: UserId,
    pub lat: f64,
    pub lng: f64,
    pub company_id: CompanyId,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Chat,
    System,
}

/// An entry of the alert feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEvent {
    /// `None` for alerts synthesized locally from chat pushes.
    #[serde(default)]
    pub id: Option<NotificationId>,
    pub kind: NotificationKind,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    /// Message that produced a CHAT notification, when known.
    #[serde(default)]
    pub message_id: Option<MessageId>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
