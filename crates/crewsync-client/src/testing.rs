//! Scriptable in-process backend and fixtures for component tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crewsync_net::{MemoryConnector, MemoryServer};
use crewsync_shared::{
    CompanyId, DeliveryState, LoginResult, Message, MessageId, NotificationEvent, NotificationId,
    OutgoingMessage, PermissionSet, Role, Room, RoomId, RoomKind, Session, UserId,
};
use crewsync_store::Database;

use crate::config::ClientConfig;
use crate::context::ClientContext;
use crate::error::ServiceError;
use crate::services::{
    AuthorizationService, BearerToken, MessageService, NotificationService, RoomService, Services,
};

pub(crate) const ME: &str = "u-foreman";
pub(crate) const COMPANY: &str = "acme";

#[derive(Default)]
pub(crate) struct FakeState {
    pub permissions: HashMap<Role, PermissionSet>,
    pub fail_permissions: bool,
    pub permission_calls: Vec<Role>,
    pub history: HashMap<RoomId, Vec<Message>>,
    pub fail_history: bool,
    pub manual_acks: bool,
    pub fail_sends: Option<ServiceError>,
    pub posted: Vec<(RoomId, OutgoingMessage)>,
    pub fail_mark_read: bool,
    pub rooms: Vec<Room>,
    pub directs_created: Vec<UserId>,
    pub notifications: Vec<NotificationEvent>,
    pub notification_reads: Vec<NotificationId>,
    pub fail_notification_reads: bool,
    pub mark_all_calls: Vec<DateTime<Utc>>,
    /// Ordered call log, e.g. `history:r1`, `mark_read:r1`.
    pub calls: Vec<String>,
    next_id: u64,
}

struct PendingAck {
    room_id: RoomId,
    message: OutgoingMessage,
    reply: oneshot::Sender<Result<Message, ServiceError>>,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
    acks: Mutex<Vec<PendingAck>>,
    permission_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set<F: FnOnce(&mut FakeState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn read<T, F: FnOnce(&FakeState) -> T>(&self, f: F) -> T {
        f(&self.state.lock().unwrap())
    }

    /// The next permission lookup waits until the returned sender fires.
    pub fn hold_next_refresh(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.permission_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// `true` once a held permission lookup has started.
    pub fn refresh_in_flight(&self) -> bool {
        self.permission_gate.lock().unwrap().is_none()
    }

    pub fn pending_posts(&self) -> usize {
        self.acks.lock().unwrap().len()
    }

    pub async fn wait_for_posts(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.pending_posts() < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("posts did not arrive");
    }

    /// Acknowledge the `index`-th outstanding post with server id `id`.
    pub fn ack(&self, index: usize, id: &str) -> Message {
        let pending = self.acks.lock().unwrap().remove(index);
        let confirmed = server_copy(&pending.room_id, &pending.message, id);
        let _ = pending.reply.send(Ok(confirmed.clone()));
        confirmed
    }

    pub fn reject(&self, index: usize, error: ServiceError) {
        let pending = self.acks.lock().unwrap().remove(index);
        let _ = pending.reply.send(Err(error));
    }

    /// Temp id of the `index`-th outstanding post.
    pub fn pending_temp_id(&self, index: usize) -> crewsync_shared::TempId {
        self.acks.lock().unwrap()[index].message.client_temp_id
    }
}

fn server_copy(room_id: &RoomId, message: &OutgoingMessage, id: &str) -> Message {
    Message {
        id: Some(MessageId::from(id)),
        client_temp_id: Some(message.client_temp_id),
        room_id: room_id.clone(),
        sender_id: UserId::from(ME),
        sender_display: "Dana".into(),
        body: message.body.clone(),
        attachments: message.attachments.clone(),
        created_at: Utc::now(),
        delivery_state: DeliveryState::Confirmed,
    }
}

#[async_trait]
impl AuthorizationService for FakeBackend {
    async fn current_permissions(&self, role: Role) -> Result<PermissionSet, ServiceError> {
        let gate = self.permission_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let mut state = self.state.lock().unwrap();
        state.permission_calls.push(role);
        if state.fail_permissions {
            return Err(ServiceError::Status(503));
        }
        Ok(state.permissions.get(&role).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl MessageService for FakeBackend {
    async fn post_message(
        &self,
        room_id: &RoomId,
        message: &OutgoingMessage,
    ) -> Result<Message, ServiceError> {
        {
            let mut state = self.state.lock().unwrap();
            state.posted.push((room_id.clone(), message.clone()));
            state.calls.push(format!("post:{room_id}"));
            if let Some(err) = state.fail_sends.clone() {
                return Err(err);
            }
            if !state.manual_acks {
                state.next_id += 1;
                let id = format!("m{}", state.next_id);
                return Ok(server_copy(room_id, message, &id));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.acks.lock().unwrap().push(PendingAck {
            room_id: room_id.clone(),
            message: message.clone(),
            reply: tx,
        });
        rx.await
            .unwrap_or_else(|_| Err(ServiceError::Network("ack dropped".into())))
    }

    async fn history(&self, room_id: &RoomId) -> Result<Vec<Message>, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("history:{room_id}"));
        if state.fail_history {
            return Err(ServiceError::Timeout);
        }
        Ok(state.history.get(room_id).cloned().unwrap_or_default())
    }

    async fn mark_room_read(&self, room_id: &RoomId) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("mark_read:{room_id}"));
        if state.fail_mark_read {
            return Err(ServiceError::Status(500));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomService for FakeBackend {
    async fn rooms(&self) -> Result<Vec<Room>, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("rooms".into());
        Ok(state.rooms.clone())
    }

    async fn create_direct(&self, target: &UserId) -> Result<Room, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.directs_created.push(target.clone());
        let mut room = room(&format!("dm-{target}"), RoomKind::Direct);
        room.participants = vec![UserId::from(ME), target.clone()];
        room.other_role = Some(Role::Worker);
        Ok(room)
    }
}

#[async_trait]
impl NotificationService for FakeBackend {
    async fn notifications(&self) -> Result<Vec<NotificationEvent>, ServiceError> {
        Ok(self.state.lock().unwrap().notifications.clone())
    }

    async fn mark_notification_read(&self, id: &NotificationId) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_notification_reads {
            return Err(ServiceError::Status(503));
        }
        state.notification_reads.push(id.clone());
        Ok(())
    }

    async fn mark_all_read(&self, before: DateTime<Utc>) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_notification_reads {
            return Err(ServiceError::Status(503));
        }
        state.mark_all_calls.push(before);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub(crate) fn test_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_millis(300),
        refresh_timeout: Duration::from_millis(300),
        reconnect_base: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(40),
        location_max_staleness: Duration::from_millis(50),
        ..ClientConfig::default()
    }
}

/// Context over a fake backend, an in-memory store and a loopback transport.
pub(crate) fn test_context(backend: &Arc<FakeBackend>) -> (Arc<ClientContext>, MemoryServer) {
    let (connector, server) = MemoryConnector::pair();
    let services = Services::from_backend(backend.clone(), Arc::new(BearerToken::new()));
    let ctx = ClientContext::new(
        test_config(),
        Arc::new(connector),
        services,
        Database::open_in_memory().unwrap(),
    );
    (ctx, server)
}

pub(crate) fn session(role: Role) -> Session {
    Session {
        user_id: UserId::from(ME),
        display_name: "Dana".into(),
        role,
        company_id: CompanyId::from(COMPANY),
        permissions: ["chat.send"].into_iter().collect(),
    }
}

pub(crate) fn login(role: Role) -> LoginResult {
    LoginResult {
        session: session(role),
        token: "tok-1".into(),
    }
}

pub(crate) fn room(id: &str, kind: RoomKind) -> Room {
    Room {
        id: RoomId::from(id),
        kind,
        has_client: false,
        has_sub: false,
        other_role: None,
        display_name: format!("Room {id}"),
        participants: vec![UserId::from(ME)],
        last_message: None,
        unread_count: 0,
    }
}

/// A message pushed by another participant.
pub(crate) fn pushed(room_id: &str, id: &str, sender: &str, body: &str) -> Message {
    Message {
        id: Some(MessageId::from(id)),
        client_temp_id: None,
        room_id: RoomId::from(room_id),
        sender_id: UserId::from(sender),
        sender_display: sender.to_string(),
        body: body.to_string(),
        attachments: Vec::new(),
        created_at: Utc::now(),
        delivery_state: DeliveryState::Confirmed,
    }
}
