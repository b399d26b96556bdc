//! Unread counters and the alert feed, independent of the open room.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crewsync_shared::constants::SEEN_MESSAGE_WINDOW;
use crewsync_shared::{
    ClientEvent, Message, MessageId, NotificationEvent, NotificationId, NotificationKind,
    ReadScope, Room, RoomId,
};

use crate::context::ClientContext;
use crate::error::Result;
use crate::events::UiEvent;
use crate::rooms::RoomDirectory;
use crate::session::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOutcome {
    /// No session to attribute the event to.
    Ignored,
    /// Sent by the signed-in user.
    Own,
    /// Already counted under the same message id.
    Duplicate,
    /// The room is open; the message channel displays it.
    Focused,
    Counted { unread: u32 },
}

/// Bounded set of recently seen message ids.
struct SeenWindow {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
}

impl SeenWindow {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Returns `true` if `id` was not seen yet.
    fn insert(&mut self, id: &MessageId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > SEEN_MESSAGE_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

struct FeedState {
    /// Oldest first.
    feed: Vec<NotificationEvent>,
    counted: SeenWindow,
    alerted: SeenWindow,
    /// Cutoff of the latest mark-all-read.
    read_watermark: Option<DateTime<Utc>>,
}

impl FeedState {
    fn new() -> Self {
        Self {
            feed: Vec::new(),
            counted: SeenWindow::new(),
            alerted: SeenWindow::new(),
            read_watermark: None,
        }
    }

    fn covered_by_watermark(&self, created_at: DateTime<Utc>) -> bool {
        self.read_watermark
            .map_or(false, |cutoff| created_at <= cutoff)
    }

    /// Merge a server notification. Returns the entry if it was added.
    fn merge(&mut self, mut event: NotificationEvent) -> Option<NotificationEvent> {
        if let Some(id) = &event.id {
            if let Some(existing) = self.feed.iter_mut().find(|e| e.id.as_ref() == Some(id)) {
                // never un-read locally read entries
                existing.is_read |= event.is_read;
                return None;
            }
        }

        if let Some(message_id) = &event.message_id {
            if !self.alerted.insert(message_id) {
                if let Some(local) = self
                    .feed
                    .iter_mut()
                    .find(|e| e.id.is_none() && e.message_id.as_ref() == Some(message_id))
                {
                    local.id = event.id.clone();
                    local.is_read |= event.is_read;
                }
                return None;
            }
        }

        event.is_read |= self.covered_by_watermark(event.created_at);
        self.insert_sorted(event.clone());
        Some(event)
    }

    fn insert_sorted(&mut self, event: NotificationEvent) {
        let at = self
            .feed
            .partition_point(|e| e.created_at <= event.created_at);
        self.feed.insert(at, event);
    }
}

pub struct NotificationAggregator {
    ctx: Arc<ClientContext>,
    session: Arc<SessionStore>,
    directory: Arc<RoomDirectory>,
    state: Mutex<FeedState>,
}

impl NotificationAggregator {
    pub fn new(
        ctx: Arc<ClientContext>,
        session: Arc<SessionStore>,
        directory: Arc<RoomDirectory>,
    ) -> Self {
        Self {
            ctx,
            session,
            directory,
            state: Mutex::new(FeedState::new()),
        }
    }

    /// Count a pushed chat message unless its room is open.
    pub fn on_chat_message(&self, room_id: &RoomId, message: &Message) -> ChatOutcome {
        let Some(session) = self.session.current() else {
            return ChatOutcome::Ignored;
        };
        if message.sender_id == session.user_id {
            return ChatOutcome::Own;
        }

        if let Some(id) = &message.id {
            if !self.state().counted.insert(id) {
                return ChatOutcome::Duplicate;
            }
        }

        if self.directory.is_focused(room_id) {
            self.acknowledge_open_room(room_id);
            return ChatOutcome::Focused;
        }

        let unread = self.ctx.unread.increment(room_id);
        self.ctx.events.emit(UiEvent::UnreadChanged {
            room_id: room_id.clone(),
            count: unread,
        });

        let title = self
            .directory
            .get(room_id)
            .map(|room| room.display_name)
            .unwrap_or_else(|| message.sender_display.clone());
        let alert = {
            let mut state = self.state();
            let fresh = message
                .id
                .as_ref()
                .map_or(true, |id| state.alerted.insert(id));
            fresh.then(|| {
                let alert = NotificationEvent {
                    id: None,
                    kind: NotificationKind::Chat,
                    room_id: Some(room_id.clone()),
                    message_id: message.id.clone(),
                    title,
                    body: format!("{}: {}", message.sender_display, message.body),
                    is_read: state.covered_by_watermark(message.created_at),
                    created_at: message.created_at,
                };
                state.insert_sorted(alert.clone());
                alert
            })
        };

        if let Some(alert) = alert {
            self.ctx.events.emit(UiEvent::Alert(alert));
        }
        debug!(room = %room_id, unread, "Chat message counted");
        ChatOutcome::Counted { unread }
    }

    /// Append a pushed notification. Returns `true` if the feed grew.
    pub fn on_notification(&self, event: NotificationEvent) -> bool {
        let focused_chat = event.kind == NotificationKind::Chat
            && event
                .room_id
                .as_ref()
                .map_or(false, |room| self.directory.is_focused(room));
        if focused_chat {
            debug!("Chat notification for the open room suppressed");
            return false;
        }

        let added = self.state().merge(event);
        match added {
            Some(alert) => {
                self.ctx.events.emit(UiEvent::Alert(alert));
                true
            }
            None => false,
        }
    }

    /// Acknowledge one notification. Idempotent.
    ///
    /// The entry stays unread locally until the server accepts the
    /// acknowledgment, so a failed call can be retried.
    pub async fn mark_read(&self, id: &NotificationId) -> Result<bool> {
        let unread = self
            .state()
            .feed
            .iter()
            .any(|e| e.id.as_ref() == Some(id) && !e.is_read);
        if !unread {
            return Ok(false);
        }

        self.ctx
            .services
            .notifications
            .mark_notification_read(id)
            .await?;

        let mut state = self.state();
        let changed = match state.feed.iter_mut().find(|e| e.id.as_ref() == Some(id)) {
            Some(entry) if !entry.is_read => {
                entry.is_read = true;
                true
            }
            _ => false,
        };
        Ok(changed)
    }

    /// Mark every alert created up to now as read. Idempotent.
    ///
    /// Alerts created after the cutoff, including ones that race with this
    /// call, stay unread; late deliveries older than the cutoff arrive read.
    /// Nothing changes locally unless the server accepts the cutoff.
    pub async fn mark_all_read(&self) -> Result<usize> {
        let cutoff = Utc::now();
        self.ctx
            .services
            .notifications
            .mark_all_read(cutoff)
            .await?;

        let changed = {
            let mut state = self.state();
            state.read_watermark = Some(
                state
                    .read_watermark
                    .map_or(cutoff, |previous| previous.max(cutoff)),
            );
            let mut changed = 0;
            for entry in state
                .feed
                .iter_mut()
                .filter(|e| !e.is_read && e.created_at <= cutoff)
            {
                entry.is_read = true;
                changed += 1;
            }
            changed
        };

        self.ctx.emit(ClientEvent::MarkRead {
            scope: ReadScope::All,
        });
        info!(changed, "Alerts marked read");
        Ok(changed)
    }

    /// Periodic re-fetch from the notification service.
    pub async fn refresh(&self) -> Result<usize> {
        let fetched = self.ctx.services.notifications.notifications().await?;
        let added: Vec<NotificationEvent> = {
            let mut state = self.state();
            fetched
                .into_iter()
                .filter_map(|event| state.merge(event))
                .collect()
        };

        for alert in added.iter().filter(|a| !a.is_read) {
            self.ctx.events.emit(UiEvent::Alert(alert.clone()));
        }
        debug!(added = added.len(), "Notifications refreshed");
        Ok(added.len())
    }

    /// Adopt the server's unread counts from a room listing.
    pub fn seed_unread(&self, rooms: &[Room]) {
        for room in rooms {
            if !self.directory.is_focused(&room.id) {
                self.ctx.unread.seed(&room.id, room.unread_count);
            }
        }
    }

    pub fn feed(&self) -> Vec<NotificationEvent> {
        self.state().feed.clone()
    }

    pub fn unread_alerts(&self) -> usize {
        self.state().feed.iter().filter(|e| !e.is_read).count()
    }

    pub(crate) fn clear(&self) {
        *self.state() = FeedState::new();
        self.ctx.unread.reset();
    }

    fn acknowledge_open_room(&self, room_id: &RoomId) {
        let messages = self.ctx.services.messages.clone();
        let room = room_id.clone();
        tokio::spawn(async move {
            if let Err(e) = messages.mark_room_read(&room).await {
                debug!(room = %room, error = %e, "Read acknowledgment for open room failed");
            }
        });
        self.ctx.emit(ClientEvent::MarkRead {
            scope: ReadScope::Room(room_id.clone()),
        });
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
