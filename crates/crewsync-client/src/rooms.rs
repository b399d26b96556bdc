//! Room classification and role-based visibility.
//!
//! Classification decides what a user may see, not only how rooms are
//! grouped, so [`classify`] is a pure function over the closed role and
//! room-kind unions.

use std::sync::{Arc, RwLock, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, info};

use crewsync_shared::{ClientEvent, Message, Role, Room, RoomId, RoomKind, Session, UserId};

use crate::context::ClientContext;
use crate::error::Result;
use crate::events::UiEvent;
use crate::session::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Internal,
    Client,
    Sub,
}

/// Category membership of one room. A room may sit in several categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Categories {
    pub internal: bool,
    pub client: bool,
    pub sub: bool,
}

impl Categories {
    pub fn contains(&self, category: Category) -> bool {
        match category {
            Category::Internal => self.internal,
            Category::Client => self.client,
            Category::Sub => self.sub,
        }
    }
}

pub fn classify(room: &Room) -> Categories {
    let direct_with = |role: Role| room.kind == RoomKind::Direct && room.other_role == Some(role);

    let internal = matches!(room.kind, RoomKind::Internal | RoomKind::ProjectGroup)
        || (room.kind == RoomKind::Direct
            && room.other_role.map_or(false, |role| role.is_internal_staff()));

    let client = matches!(room.kind, RoomKind::AdminClient | RoomKind::SubClient)
        || direct_with(Role::Client)
        || (room.kind == RoomKind::ProjectGroup && room.has_client);

    let sub = room.kind == RoomKind::AdminSub
        || direct_with(Role::Subcontractor)
        || (room.kind == RoomKind::ProjectGroup && room.has_sub);

    Categories {
        internal,
        client,
        sub,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tab {
    pub category: Category,
    pub rooms: Vec<Room>,
}

/// What the session is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "layout", content = "content", rename_all = "snake_case")]
pub enum DirectoryView {
    /// Internal staff. Elevated roles get INTERNAL, CLIENT and SUB; others
    /// only INTERNAL.
    Tabs(Vec<Tab>),
    /// Clients and subcontractors: rooms they participate in, uncategorized.
    Flat(Vec<Room>),
}

impl DirectoryView {
    pub fn tab(&self, category: Category) -> Option<&[Room]> {
        match self {
            DirectoryView::Tabs(tabs) => tabs
                .iter()
                .find(|tab| tab.category == category)
                .map(|tab| tab.rooms.as_slice()),
            DirectoryView::Flat(_) => None,
        }
    }
}

/// Pure visibility rule over a room list.
pub fn view_for(session: &Session, rooms: &[Room]) -> DirectoryView {
    if session.role.is_external() {
        let visible = rooms
            .iter()
            .filter(|room| room.participants.contains(&session.user_id))
            .cloned()
            .collect();
        return DirectoryView::Flat(visible);
    }

    let categories: &[Category] = if session.role.has_elevated_visibility() {
        &[Category::Internal, Category::Client, Category::Sub]
    } else {
        &[Category::Internal]
    };

    let tabs = categories
        .iter()
        .map(|&category| Tab {
            category,
            rooms: rooms
                .iter()
                .filter(|room| classify(room).contains(category))
                .cloned()
                .collect(),
        })
        .collect();
    DirectoryView::Tabs(tabs)
}

pub struct RoomDirectory {
    ctx: Arc<ClientContext>,
    session: Arc<SessionStore>,
    rooms: RwLock<Vec<Room>>,
    focused: RwLock<Option<RoomId>>,
}

impl RoomDirectory {
    pub fn new(ctx: Arc<ClientContext>, session: Arc<SessionStore>) -> Self {
        Self {
            ctx,
            session,
            rooms: RwLock::new(Vec::new()),
            focused: RwLock::new(None),
        }
    }

    /// Replace the room list from the room service and join every room.
    pub async fn refresh(&self) -> Result<Vec<Room>> {
        let rooms = self.ctx.services.rooms.rooms().await?;
        info!(count = rooms.len(), "Room directory refreshed");

        *self.rooms_mut() = rooms.clone();
        for room in &rooms {
            self.join(&room.id);
        }
        self.ctx.events.emit(UiEvent::RoomsChanged);
        Ok(rooms)
    }

    /// Add a room pushed by the hub. Returns `false` if it was known.
    pub fn insert(&self, room: Room) -> bool {
        let id = room.id.clone();
        {
            let mut guard = self.rooms_mut();
            if guard.iter().any(|known| known.id == id) {
                return false;
            }
            guard.push(room);
        }

        debug!(room = %id, "Room added");
        self.join(&id);
        self.ctx.events.emit(UiEvent::RoomsChanged);
        true
    }

    /// Open (or reuse) a direct conversation with `target`.
    pub async fn start_direct(&self, target: &UserId) -> Result<Room> {
        let existing = self.read(|rooms| {
            rooms
                .iter()
                .find(|room| room.kind == RoomKind::Direct && room.participants.contains(target))
                .cloned()
        });
        if let Some(room) = existing {
            return Ok(room);
        }

        let room = self.ctx.services.rooms.create_direct(target).await?;
        info!(room = %room.id, target = %target, "Direct conversation created");
        self.insert(room.clone());
        Ok(room)
    }

    /// Re-register interest in every known room after a reconnect.
    pub fn rejoin_all(&self) -> usize {
        let ids: Vec<RoomId> = self.read(|rooms| rooms.iter().map(|room| room.id.clone()).collect());
        for id in &ids {
            self.join(id);
        }
        debug!(count = ids.len(), "Rejoined rooms");
        ids.len()
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.read(|rooms| rooms.iter().any(|room| &room.id == room_id))
    }

    pub fn get(&self, room_id: &RoomId) -> Option<Room> {
        self.read(|rooms| rooms.iter().find(|room| &room.id == room_id).cloned())
    }

    /// Every known room with live unread counts.
    pub fn rooms(&self) -> Vec<Room> {
        let unread = self.ctx.unread.snapshot();
        self.read(|rooms| {
            rooms
                .iter()
                .map(|room| Room {
                    unread_count: unread.get(&room.id).copied().unwrap_or(0),
                    ..room.clone()
                })
                .collect()
        })
    }

    pub fn view(&self) -> Result<DirectoryView> {
        let session = self.session.require()?;
        Ok(view_for(&session, &self.rooms()))
    }

    pub fn focus(&self, room_id: &RoomId) {
        *self.focused_mut() = Some(room_id.clone());
    }

    /// Clear focus if `room_id` is the focused room.
    pub fn unfocus(&self, room_id: &RoomId) {
        let mut focused = self.focused_mut();
        if focused.as_ref() == Some(room_id) {
            *focused = None;
        }
    }

    pub fn focused(&self) -> Option<RoomId> {
        self.focused
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_focused(&self, room_id: &RoomId) -> bool {
        self.focused().as_ref() == Some(room_id)
    }

    pub(crate) fn record_last_message(&self, message: &Message) {
        let mut rooms = self.rooms_mut();
        if let Some(room) = rooms.iter_mut().find(|room| room.id == message.room_id) {
            let newer = room
                .last_message
                .as_ref()
                .map_or(true, |last| last.created_at <= message.created_at);
            if newer {
                room.last_message = Some(message.summary());
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.rooms_mut().clear();
        *self.focused_mut() = None;
    }

    fn join(&self, room_id: &RoomId) {
        self.ctx.emit(ClientEvent::JoinRoom {
            room_id: room_id.clone(),
        });
    }

    fn read<T, F: FnOnce(&[Room]) -> T>(&self, f: F) -> T {
        let rooms = self
            .rooms
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&rooms)
    }

    fn rooms_mut(&self) -> RwLockWriteGuard<'_, Vec<Room>> {
        self.rooms
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn focused_mut(&self) -> RwLockWriteGuard<'_, Option<RoomId>> {
        self.focused
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{self, FakeBackend};

    fn group(id: &str, has_client: bool, has_sub: bool) -> Room {
        Room {
            has_client,
            has_sub,
            ..testing::room(id, RoomKind::ProjectGroup)
        }
    }

    fn direct(id: &str, other: Role) -> Room {
        Room {
            other_role: Some(other),
            ..testing::room(id, RoomKind::Direct)
        }
    }

    fn ids(rooms: &[Room]) -> Vec<&str> {
        rooms.iter().map(|room| room.id.as_str()).collect()
    }

    #[test]
    fn test_project_group_with_client_for_owner() {
        let rooms = vec![group("g1", true, false)];
        let view = view_for(&testing::session(Role::Owner), &rooms);

        assert_eq!(ids(view.tab(Category::Internal).unwrap()), vec!["g1"]);
        assert_eq!(ids(view.tab(Category::Client).unwrap()), vec!["g1"]);
        assert!(view.tab(Category::Sub).unwrap().is_empty());
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(
            classify(&direct("d1", Role::Foreman)),
            Categories {
                internal: true,
                client: false,
                sub: false
            }
        );
        assert_eq!(
            classify(&direct("d2", Role::Client)),
            Categories {
                internal: false,
                client: true,
                sub: false
            }
        );
        assert!(classify(&direct("d3", Role::Subcontractor)).sub);
        assert!(classify(&testing::room("i1", RoomKind::Internal)).internal);
        assert!(classify(&testing::room("ac", RoomKind::AdminClient)).client);
        assert!(classify(&testing::room("as", RoomKind::AdminSub)).sub);

        let sub_client = classify(&testing::room("sc", RoomKind::SubClient));
        assert!(sub_client.client && !sub_client.sub && !sub_client.internal);

        let both = classify(&group("g2", true, true));
        assert!(both.internal && both.client && both.sub);
    }

    #[test]
    fn test_staff_without_elevation_sees_internal_only() {
        let rooms = vec![
            group("g1", true, false),
            testing::room("ac", RoomKind::AdminClient),
        ];
        let view = view_for(&testing::session(Role::Worker), &rooms);

        assert_eq!(ids(view.tab(Category::Internal).unwrap()), vec!["g1"]);
        assert!(view.tab(Category::Client).is_none());
        assert!(view.tab(Category::Sub).is_none());
    }

    #[test]
    fn test_external_roles_get_flat_participant_list() {
        let mut mine = testing::room("ac", RoomKind::AdminClient);
        mine.participants = vec![UserId::from(testing::ME)];
        let mut other = testing::room("g9", RoomKind::ProjectGroup);
        other.participants = vec![UserId::from("u-someone")];

        let view = view_for(&testing::session(Role::Client), &[mine, other]);
        match view {
            DirectoryView::Flat(rooms) => assert_eq!(ids(&rooms), vec!["ac"]),
            other => panic!("expected flat view, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_insert_and_start_direct() {
        let backend = FakeBackend::new();
        backend.set(|s| s.rooms = vec![group("g1", false, false)]);
        let (ctx, _server) = testing::test_context(&backend);
        let session = Arc::new(SessionStore::new(ctx.clone()));
        session.establish(&testing::login(Role::Owner)).unwrap();
        let directory = RoomDirectory::new(ctx, session);

        directory.refresh().await.unwrap();
        assert!(directory.contains(&RoomId::from("g1")));

        assert!(directory.insert(testing::room("r-new", RoomKind::Internal)));
        assert!(!directory.insert(testing::room("r-new", RoomKind::Internal)));

        let target = UserId::from("u-worker");
        let first = directory.start_direct(&target).await.unwrap();
        let second = directory.start_direct(&target).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(backend.read(|s| s.directs_created.len()), 1);
        assert_eq!(directory.rejoin_all(), 3);
    }

    #[tokio::test]
    async fn test_focus_and_last_message() {
        let backend = FakeBackend::new();
        let (ctx, _server) = testing::test_context(&backend);
        let session = Arc::new(SessionStore::new(ctx.clone()));
        let directory = RoomDirectory::new(ctx, session);
        directory.insert(testing::room("r1", RoomKind::Internal));

        directory.focus(&RoomId::from("r1"));
        assert!(directory.is_focused(&RoomId::from("r1")));
        directory.unfocus(&RoomId::from("r2"));
        assert_eq!(directory.focused(), Some(RoomId::from("r1")));
        directory.unfocus(&RoomId::from("r1"));
        assert!(directory.focused().is_none());

        directory.record_last_message(&testing::pushed("r1", "m1", "u-pm", "Rebar delivered"));
        let room = directory.get(&RoomId::from("r1")).unwrap();
        assert_eq!(room.last_message.unwrap().body, "Rebar delivered");
    }

    #[tokio::test]
    async fn test_refresh_recovers_poisoned_lock() {
        let backend = FakeBackend::new();
        backend.set(|s| s.rooms = vec![group("g1", false, false), group("g2", false, false)]);
        let (ctx, _server) = testing::test_context(&backend);
        let session = Arc::new(SessionStore::new(ctx.clone()));
        let directory = RoomDirectory::new(ctx, session);

        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = directory.rooms.write().unwrap();
                    panic!("writer died holding the room list");
                })
                .join();
        });
        assert!(directory.rooms.is_poisoned());

        directory.refresh().await.unwrap();
        assert_eq!(directory.rooms().len(), 2);
        directory.focus(&RoomId::from("g2"));
        assert!(directory.is_focused(&RoomId::from("g2")));
    }
}
