//! Contracts of the collaborator services the sync core consumes.
//!
//! The core only depends on these traits; [`crate::http::HttpBackend`] is
//! the production implementation.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crewsync_shared::{
    Message, NotificationEvent, NotificationId, OutgoingMessage, PermissionSet, Role, Room,
    RoomId, UserId,
};

use crate::error::ServiceError;

/// Permission lookup. Idempotent and safe to retry.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn current_permissions(&self, role: Role) -> Result<PermissionSet, ServiceError>;
}

#[async_trait]
pub trait MessageService: Send + Sync {
    /// Persist a message; the answer carries the server id and timestamp.
    async fn post_message(
        &self,
        room_id: &RoomId,
        message: &OutgoingMessage,
    ) -> Result<Message, ServiceError>;

    /// Full history in server order.
    async fn history(&self, room_id: &RoomId) -> Result<Vec<Message>, ServiceError>;

    /// Durable read acknowledgment up to now.
    async fn mark_room_read(&self, room_id: &RoomId) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait RoomService: Send + Sync {
    async fn rooms(&self) -> Result<Vec<Room>, ServiceError>;

    async fn create_direct(&self, target: &UserId) -> Result<Room, ServiceError>;
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notifications(&self) -> Result<Vec<NotificationEvent>, ServiceError>;

    async fn mark_notification_read(&self, id: &NotificationId) -> Result<(), ServiceError>;

    /// Mark every notification created at or before `before` as read.
    async fn mark_all_read(&self, before: DateTime<Utc>) -> Result<(), ServiceError>;
}

/// Bearer token shared between the session lifecycle and the HTTP backend.
#[derive(Debug, Default)]
pub struct BearerToken(RwLock<Option<String>>);

impl BearerToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.0.write() {
            *guard = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.0.write() {
            *guard = None;
        }
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().ok().and_then(|guard| guard.clone())
    }
}

/// The four collaborator services handed to every component.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthorizationService>,
    pub messages: Arc<dyn MessageService>,
    pub rooms: Arc<dyn RoomService>,
    pub notifications: Arc<dyn NotificationService>,
    pub bearer: Arc<BearerToken>,
}

impl Services {
    /// Use one backend for every service.
    pub fn from_backend<B>(backend: Arc<B>, bearer: Arc<BearerToken>) -> Self
    where
        B: AuthorizationService + MessageService + RoomService + NotificationService + 'static,
    {
        Self {
            auth: backend.clone(),
            messages: backend.clone(),
            rooms: backend.clone(),
            notifications: backend,
            bearer,
        }
    }
}
