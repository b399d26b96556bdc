//! Per-room message logs with optimistic echo.
//!
//! A send is a two-phase commit keyed by [`TempId`]: the PENDING echo is
//! buffered under its temporary id, and whichever arrives first (the HTTP
//! confirmation or a hub push carrying the same temporary id) resolves it.
//! Resolution is always a lookup by temporary id, never by position.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crewsync_shared::{
    ClientEvent, DeliveryState, Draft, Message, OutgoingMessage, ReadScope, RoomId, TempId,
};

use crate::context::ClientContext;
use crate::error::{Result, SyncError};
use crate::events::UiEvent;
use crate::rooms::RoomDirectory;
use crate::session::SessionStore;

/// How a confirmation or push was folded into a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// A pending entry became confirmed.
    Replaced,
    /// Appended as a new confirmed entry.
    Appended,
    /// Already present under its server id.
    AlreadyPresent,
    /// Nothing pending under that temporary id and the id is unknown.
    Stale,
}

/// Ordered log of one room: server-ordered confirmed entries followed by
/// the local pending entries in send order.
#[derive(Debug, Default, Clone)]
pub struct RoomLog {
    confirmed: Vec<Message>,
    pending: Vec<Message>,
}

impl RoomLog {
    pub fn entries(&self) -> Vec<Message> {
        self.confirmed
            .iter()
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn push_pending(&mut self, message: Message) {
        self.pending.push(message);
    }

    fn take_pending(&mut self, temp_id: TempId) -> Option<Message> {
        let index = self
            .pending
            .iter()
            .position(|m| m.client_temp_id == Some(temp_id))?;
        Some(self.pending.remove(index))
    }

    fn has_confirmed(&self, message: &Message) -> bool {
        message.id.is_some() && self.confirmed.iter().any(|m| m.id == message.id)
    }

    /// Resolve a send by its temporary id.
    fn confirm(&mut self, temp_id: TempId, mut confirmed: Message) -> Reconcile {
        confirmed.delivery_state = DeliveryState::Confirmed;
        let was_pending = self.take_pending(temp_id).is_some();

        if self.has_confirmed(&confirmed) {
            return Reconcile::AlreadyPresent;
        }
        if !was_pending {
            return Reconcile::Stale;
        }
        self.confirmed.push(confirmed);
        Reconcile::Replaced
    }

    /// Fold in a message pushed by the hub.
    fn apply_push(&mut self, mut message: Message) -> Reconcile {
        message.delivery_state = DeliveryState::Confirmed;
        if self.has_confirmed(&message) {
            return Reconcile::AlreadyPresent;
        }

        let reconciled = message
            .client_temp_id
            .and_then(|temp_id| self.take_pending(temp_id))
            .is_some();
        self.confirmed.push(message);

        if reconciled {
            Reconcile::Replaced
        } else {
            Reconcile::Appended
        }
    }

    /// Replace confirmed entries with a fresh history, keeping sends that
    /// are still in flight. In-flight sends already present in the history
    /// stay pending until their own confirmation resolves them.
    fn replace_history(&mut self, history: Vec<Message>) {
        self.confirmed = history
            .into_iter()
            .map(|mut m| {
                m.delivery_state = DeliveryState::Confirmed;
                m
            })
            .collect();
    }
}

pub struct MessageChannel {
    ctx: Arc<ClientContext>,
    session: Arc<SessionStore>,
    directory: Arc<RoomDirectory>,
    logs: Mutex<HashMap<RoomId, RoomLog>>,
}

impl MessageChannel {
    pub fn new(
        ctx: Arc<ClientContext>,
        session: Arc<SessionStore>,
        directory: Arc<RoomDirectory>,
    ) -> Self {
        Self {
            ctx,
            session,
            directory,
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Optimistically append `draft`, persist it, then reconcile.
    ///
    /// On failure the echo is removed and the draft comes back inside
    /// [`SyncError::SendFailed`] so the composer can be restored.
    pub async fn send(&self, room_id: &RoomId, draft: Draft) -> Result<Message> {
        let session = self.session.require()?;
        let temp_id = TempId::new();

        let echo = Message::pending(
            room_id.clone(),
            session.user_id.clone(),
            session.display_name.clone(),
            draft.clone(),
            temp_id,
            Utc::now(),
        );
        self.logs().entry(room_id.clone()).or_default().push_pending(echo.clone());
        self.log_changed(room_id);
        debug!(room = %room_id, temp = %temp_id, "Message pending");

        let outgoing = OutgoingMessage {
            body: draft.body.clone(),
            attachments: draft.attachments.clone(),
            client_temp_id: temp_id,
        };

        match self.ctx.services.messages.post_message(room_id, &outgoing).await {
            Ok(confirmed) => {
                let outcome = self
                    .logs()
                    .entry(room_id.clone())
                    .or_default()
                    .confirm(temp_id, confirmed.clone());

                match outcome {
                    Reconcile::Stale => {
                        warn!(room = %room_id, error = %SyncError::StaleReconcile(temp_id), "Ignoring confirmation")
                    }
                    other => debug!(room = %room_id, outcome = ?other, "Message confirmed"),
                }

                self.directory.record_last_message(&confirmed);
                self.ctx.emit(ClientEvent::SendMessage {
                    room_id: room_id.clone(),
                    message: confirmed.clone(),
                });
                self.log_changed(room_id);
                Ok(confirmed)
            }
            Err(e) => {
                let removed = self
                    .logs()
                    .get_mut(room_id)
                    .and_then(|log| log.take_pending(temp_id));
                let mut failed = removed.unwrap_or(echo);
                failed.delivery_state = DeliveryState::Failed;

                warn!(room = %room_id, error = %e, "Message send failed");
                self.ctx.events.emit(UiEvent::SendFailed {
                    room_id: room_id.clone(),
                    message: failed,
                    reason: e.to_string(),
                });
                self.log_changed(room_id);

                Err(SyncError::SendFailed {
                    reason: e.to_string(),
                    draft,
                })
            }
        }
    }

    /// Append a pushed message in arrival order.
    pub fn receive(&self, room_id: &RoomId, message: Message) -> Reconcile {
        self.directory.record_last_message(&message);
        let outcome = self
            .logs()
            .entry(room_id.clone())
            .or_default()
            .apply_push(message);

        if outcome != Reconcile::AlreadyPresent {
            self.log_changed(room_id);
        }
        outcome
    }

    /// Focus the room, load its history, then acknowledge reads.
    ///
    /// The unread counter is cleared only after the server accepted the
    /// read acknowledgment, so a crash in between leaves it unread. If the
    /// history cannot be loaded the room is unfocused again.
    pub async fn open_room(&self, room_id: &RoomId) -> Result<Vec<Message>> {
        self.directory.focus(room_id);

        let history = match self.ctx.services.messages.history(room_id).await {
            Ok(history) => history,
            Err(e) => {
                self.directory.unfocus(room_id);
                warn!(room = %room_id, error = %e, "History load failed, room not opened");
                return Err(e.into());
            }
        };
        debug!(room = %room_id, count = history.len(), "History loaded");
        self.logs()
            .entry(room_id.clone())
            .or_default()
            .replace_history(history);
        self.log_changed(room_id);

        match self.ctx.services.messages.mark_room_read(room_id).await {
            Ok(()) => {
                if self.ctx.unread.clear(room_id) {
                    self.ctx.events.emit(UiEvent::UnreadChanged {
                        room_id: room_id.clone(),
                        count: 0,
                    });
                }
                self.ctx.emit(ClientEvent::MarkRead {
                    scope: ReadScope::Room(room_id.clone()),
                });
            }
            Err(e) => warn!(room = %room_id, error = %e, "Read acknowledgment failed, keeping unread count"),
        }

        info!(room = %room_id, "Room opened");
        Ok(self.log(room_id))
    }

    pub fn close_room(&self, room_id: &RoomId) {
        self.directory.unfocus(room_id);
        debug!(room = %room_id, "Room closed");
    }

    pub fn log(&self, room_id: &RoomId) -> Vec<Message> {
        self.logs()
            .get(room_id)
            .map(RoomLog::entries)
            .unwrap_or_default()
    }

    pub(crate) fn clear(&self) {
        self.logs().clear();
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<RoomId, RoomLog>> {
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log_changed(&self, room_id: &RoomId) {
        self.ctx.events.emit(UiEvent::LogChanged {
            room_id: room_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crewsync_shared::{Attachment, MessageId, Role, RoomKind};

    use crate::error::ServiceError;
    use crate::testing::{self, FakeBackend};

    struct Fixture {
        backend: Arc<FakeBackend>,
        ctx: Arc<ClientContext>,
        directory: Arc<RoomDirectory>,
        channel: Arc<MessageChannel>,
    }

    fn fixture() -> Fixture {
        let backend = FakeBackend::new();
        let (ctx, _server) = testing::test_context(&backend);
        let session = Arc::new(SessionStore::new(ctx.clone()));
        session.establish(&testing::login(Role::Foreman)).unwrap();
        let directory = Arc::new(RoomDirectory::new(ctx.clone(), session.clone()));
        directory.insert(testing::room("r1", RoomKind::ProjectGroup));
        let channel = Arc::new(MessageChannel::new(ctx.clone(), session, directory.clone()));
        Fixture {
            backend,
            ctx,
            directory,
            channel,
        }
    }

    fn r1() -> RoomId {
        RoomId::from("r1")
    }

    fn spawn_send(channel: &Arc<MessageChannel>, body: &str) -> tokio::task::JoinHandle<Result<Message>> {
        let channel = channel.clone();
        let draft = Draft::text(body);
        tokio::spawn(async move { channel.send(&RoomId::from("r1"), draft).await })
    }

    #[tokio::test]
    async fn test_pending_then_confirmed_in_place() {
        let f = fixture();
        f.backend.set(|s| s.manual_acks = true);
        f.channel.receive(&r1(), testing::pushed("r1", "m100", "u-pm", "Morning"));

        let sending = spawn_send(&f.channel, "Concrete poured");
        f.backend.wait_for_posts(1).await;

        let log = f.channel.log(&r1());
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].body, "Concrete poured");
        assert_eq!(log[1].delivery_state, DeliveryState::Pending);
        assert!(log[1].id.is_none());

        f.backend.ack(0, "m123");
        sending.await.unwrap().unwrap();

        let log = f.channel.log(&r1());
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].id, Some(MessageId::from("m123")));
        assert_eq!(log[1].delivery_state, DeliveryState::Confirmed);
    }

    #[tokio::test]
    async fn test_confirmed_order_follows_acknowledgments() {
        let f = fixture();
        f.backend.set(|s| s.manual_acks = true);

        let first = spawn_send(&f.channel, "first");
        f.backend.wait_for_posts(1).await;
        let second = spawn_send(&f.channel, "second");
        f.backend.wait_for_posts(2).await;
        let third = spawn_send(&f.channel, "third");
        f.backend.wait_for_posts(3).await;

        // server acknowledges "second", then "third", then "first"
        f.backend.ack(1, "m1");
        second.await.unwrap().unwrap();
        f.backend.ack(1, "m2");
        third.await.unwrap().unwrap();
        f.backend.ack(0, "m3");
        first.await.unwrap().unwrap();

        let bodies: Vec<String> = f.channel.log(&r1()).into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["second", "third", "first"]);
    }

    #[tokio::test]
    async fn test_pending_sorts_after_confirmed() {
        let f = fixture();
        f.backend.set(|s| s.manual_acks = true);

        let sending = spawn_send(&f.channel, "mine");
        f.backend.wait_for_posts(1).await;
        f.channel.receive(&r1(), testing::pushed("r1", "m7", "u-pm", "theirs"));

        let log = f.channel.log(&r1());
        assert_eq!(log[0].body, "theirs");
        assert!(log[1].is_pending());

        f.backend.ack(0, "m8");
        sending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_confirmation_keeps_body_and_attachments() {
        let f = fixture();
        let draft = Draft {
            body: "Slab photos".into(),
            attachments: vec![Attachment {
                url: "https://files.example.com/slab.jpg".into(),
                name: "slab.jpg".into(),
                content_type: Some("image/jpeg".into()),
            }],
        };

        let confirmed = f.channel.send(&r1(), draft.clone()).await.unwrap();

        assert_eq!(confirmed.to_draft(), draft);
        assert_eq!(f.channel.log(&r1())[0].to_draft(), draft);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_to_draft() {
        let f = fixture();
        f.backend.set(|s| s.fail_sends = Some(ServiceError::Status(503)));
        let mut events = f.ctx.events.subscribe();

        let err = f
            .channel
            .send(&r1(), Draft::text("Crane down"))
            .await
            .unwrap_err();

        match err {
            SyncError::SendFailed { draft, .. } => assert_eq!(draft, Draft::text("Crane down")),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(f.channel.log(&r1()).is_empty());

        let failed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(UiEvent::SendFailed { message, .. }) = events.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed.delivery_state, DeliveryState::Failed);
        assert_eq!(failed.body, "Crane down");
    }

    #[tokio::test]
    async fn test_push_before_response_is_not_duplicated() {
        let f = fixture();
        f.backend.set(|s| s.manual_acks = true);

        let sending = spawn_send(&f.channel, "Pour at 7");
        f.backend.wait_for_posts(1).await;
        let temp_id = f.backend.pending_temp_id(0);

        let mut echo = testing::pushed("r1", "m55", testing::ME, "Pour at 7");
        echo.client_temp_id = Some(temp_id);
        assert_eq!(f.channel.receive(&r1(), echo), Reconcile::Replaced);

        f.backend.ack(0, "m55");
        sending.await.unwrap().unwrap();

        let log = f.channel.log(&r1());
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, Some(MessageId::from("m55")));
    }

    #[tokio::test]
    async fn test_duplicate_push_is_ignored() {
        let f = fixture();
        let message = testing::pushed("r1", "m1", "u-pm", "hello");
        assert_eq!(f.channel.receive(&r1(), message.clone()), Reconcile::Appended);
        assert_eq!(f.channel.receive(&r1(), message), Reconcile::AlreadyPresent);
        assert_eq!(f.channel.log(&r1()).len(), 1);
    }

    #[tokio::test]
    async fn test_open_room_acknowledges_before_clearing() {
        let f = fixture();
        f.backend.set(|s| {
            s.history
                .insert(r1(), vec![testing::pushed("r1", "m1", "u-pm", "old")]);
        });
        f.ctx.unread.increment(&r1());

        let log = f.channel.open_room(&r1()).await.unwrap();

        assert_eq!(log.len(), 1);
        assert!(f.directory.is_focused(&r1()));
        assert_eq!(f.ctx.unread.get(&r1()), 0);
        assert_eq!(
            f.backend.read(|s| s.calls.clone()),
            vec!["history:r1".to_string(), "mark_read:r1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_read_ack_keeps_unread() {
        let f = fixture();
        f.backend.set(|s| s.fail_mark_read = true);
        f.ctx.unread.increment(&r1());

        f.channel.open_room(&r1()).await.unwrap();
        assert_eq!(f.ctx.unread.get(&r1()), 1);

        f.channel.close_room(&r1());
        assert!(!f.directory.is_focused(&r1()));
    }

    #[tokio::test]
    async fn test_failed_history_leaves_room_unfocused() {
        let f = fixture();
        f.backend.set(|s| s.fail_history = true);

        assert!(f.channel.open_room(&r1()).await.is_err());
        assert!(!f.directory.is_focused(&r1()));
        assert_eq!(f.backend.read(|s| s.calls.clone()), vec!["history:r1".to_string()]);
    }

    #[tokio::test]
    async fn test_history_reload_keeps_pending() {
        let f = fixture();
        f.backend.set(|s| {
            s.manual_acks = true;
            s.history
                .insert(r1(), vec![testing::pushed("r1", "m1", "u-pm", "old")]);
        });

        let sending = spawn_send(&f.channel, "in flight");
        f.backend.wait_for_posts(1).await;
        f.channel.open_room(&r1()).await.unwrap();

        let log = f.channel.log(&r1());
        assert_eq!(log.len(), 2);
        assert!(log[1].is_pending());

        f.backend.ack(0, "m2");
        sending.await.unwrap().unwrap();
    }
}
