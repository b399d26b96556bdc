//! Wires the push channel to the sync components and owns the session
//! lifecycle (login, warm start, shutdown, logout).
//!
//! Handlers registered here hold `Arc`s to the shared stores and read
//! current state through them on every event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crewsync_net::{Backoff, ConnectionState, Connector, SubscriptionId, Transport, TransportError};
use crewsync_shared::{Credential, EventKind, LoginResult, ServerEvent, Session};
use crewsync_store::Database;

use crate::channel::MessageChannel;
use crate::config::ClientConfig;
use crate::context::ClientContext;
use crate::error::{Result, SyncError};
use crate::events::UiEvent;
use crate::location::{LocationBoard, LocationBroadcaster, PositionSource};
use crate::notifications::NotificationAggregator;
use crate::rooms::RoomDirectory;
use crate::services::Services;
use crate::session::SessionStore;

pub struct SyncClient {
    ctx: Arc<ClientContext>,
    session: Arc<SessionStore>,
    directory: Arc<RoomDirectory>,
    channel: Arc<MessageChannel>,
    notifications: Arc<NotificationAggregator>,
    location: Option<LocationBroadcaster>,
    board: Arc<LocationBoard>,
    online: Arc<AtomicU64>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncClient {
    /// Build every component over one shared context. `source` is `None`
    /// on devices that never share their position.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        services: Services,
        store: Database,
        source: Option<Arc<dyn PositionSource>>,
    ) -> Self {
        let ctx = ClientContext::new(config, connector, services, store);
        let session = Arc::new(SessionStore::new(ctx.clone()));
        let directory = Arc::new(RoomDirectory::new(ctx.clone(), session.clone()));
        let channel = Arc::new(MessageChannel::new(
            ctx.clone(),
            session.clone(),
            directory.clone(),
        ));
        let notifications = Arc::new(NotificationAggregator::new(
            ctx.clone(),
            session.clone(),
            directory.clone(),
        ));
        let location =
            source.map(|source| LocationBroadcaster::new(ctx.clone(), session.clone(), source));

        Self {
            ctx,
            session,
            directory,
            channel,
            notifications,
            location,
            board: Arc::new(LocationBoard::new()),
            online: Arc::new(AtomicU64::new(0)),
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Adopt an explicit login result and bring the session online.
    pub async fn login(&self, login: LoginResult) -> Result<Session> {
        let credential = self.session.establish(&login)?;
        self.ctx.services.bearer.set(login.token.clone());
        self.start(credential).await?;
        Ok(login.session)
    }

    /// Warm start from the persisted credential. Returns `Ok(None)` when
    /// nobody is signed in on this device.
    pub async fn resume(&self) -> Result<Option<Session>> {
        let Some(credential) = self.ctx.with_store(|db| db.load_credential())? else {
            info!("No stored credential, sign-in required");
            return Ok(None);
        };
        self.ctx.services.bearer.set(credential.token.clone());

        let Some(session) = self.session.load().await? else {
            warn!("Credential stored without a session, sign-in required");
            self.ctx.services.bearer.clear();
            return Ok(None);
        };

        self.start(credential).await?;
        Ok(Some(session))
    }

    async fn start(&self, credential: Credential) -> Result<()> {
        self.install_handlers();

        match self.ctx.transport.connect(credential.clone()).await {
            Ok(()) => {}
            Err(TransportError::AuthRejected(reason)) => {
                self.ctx.events.emit(UiEvent::AuthRequired {
                    reason: reason.clone(),
                });
                return Err(SyncError::AuthRejected(reason));
            }
            Err(e) => {
                // cached state stays usable while the link is retried
                warn!(error = %e, "Push channel unreachable, retrying in background");
                self.spawn(retry_connect(
                    self.ctx.transport.clone(),
                    credential,
                    self.ctx.config.backoff(),
                    self.ctx.config.max_reconnect_attempts,
                ));
            }
        }

        self.ctx
            .events
            .emit(UiEvent::ConnectionChanged(self.ctx.transport.state()));
        self.spawn(watch_connection(
            self.ctx.clone(),
            self.directory.clone(),
            self.ctx.transport.watch_state(),
        ));

        match self.directory.refresh().await {
            Ok(rooms) => self.notifications.seed_unread(&rooms),
            Err(e) => warn!(error = %e, "Room list unavailable"),
        }
        if let Err(e) = self.notifications.refresh().await {
            warn!(error = %e, "Notification feed unavailable");
        }

        if let Some(location) = &self.location {
            location.start();
        }
        self.spawn(poll_notifications(
            self.notifications.clone(),
            self.ctx.config.notification_poll_interval,
        ));

        info!("Sync client started");
        Ok(())
    }

    /// Stop everything that talks to the network. The durable session is
    /// kept for the next [`resume`](Self::resume).
    pub async fn shutdown(&self) {
        if let Some(location) = &self.location {
            location.stop();
        }
        self.abort_tasks();
        self.remove_handlers();
        self.ctx.transport.disconnect().await;
        self.ctx
            .events
            .emit(UiEvent::ConnectionChanged(ConnectionState::Disconnected));
        info!("Sync client stopped");
    }

    /// Shut down and forget the session on this device.
    pub async fn logout(&self) -> Result<()> {
        self.shutdown().await;
        self.session.logout()?;
        self.ctx.services.bearer.clear();
        self.directory.clear();
        self.channel.clear();
        self.notifications.clear();
        self.board.clear();
        self.online.store(0, Ordering::Relaxed);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Push handlers
    // -----------------------------------------------------------------------

    fn install_handlers(&self) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !subscriptions.is_empty() {
            return;
        }
        let transport = &self.ctx.transport;

        let session = self.session.clone();
        subscriptions.push(transport.subscribe(
            EventKind::PermissionInvalidation,
            move |event| {
                if let ServerEvent::PermissionInvalidation { role } = event {
                    let outcome = session.apply_invalidation(*role);
                    debug!(role = %role, ?outcome, "Permission invalidation handled");
                }
            },
        ));

        let directory = self.directory.clone();
        let channel = self.channel.clone();
        let notifications = self.notifications.clone();
        subscriptions.push(transport.subscribe(EventKind::NewMessage, move |event| {
            let ServerEvent::NewMessage { room_id, message } = event else {
                return;
            };
            let known = directory.contains(room_id);
            channel.receive(room_id, message.clone());
            notifications.on_chat_message(room_id, message);
            if !known {
                debug!(room = %room_id, "Message for unknown room, refreshing directory");
                spawn_directory_refresh(directory.clone(), notifications.clone());
            }
        }));

        let notifications = self.notifications.clone();
        subscriptions.push(transport.subscribe(EventKind::NewNotification, move |event| {
            if let ServerEvent::NewNotification(alert) = event {
                notifications.on_notification(alert.clone());
            }
        }));

        let directory = self.directory.clone();
        let notifications = self.notifications.clone();
        subscriptions.push(transport.subscribe(EventKind::NewRoom, move |event| {
            if let ServerEvent::NewRoom { room } = event {
                if directory.insert(room.clone()) {
                    notifications.seed_unread(std::slice::from_ref(room));
                }
            }
        }));

        let board = self.board.clone();
        let ctx = self.ctx.clone();
        subscriptions.push(transport.subscribe(EventKind::LocationUpdate, move |event| {
            if let ServerEvent::LocationUpdate(sample) = event {
                if board.apply(sample.clone()) {
                    ctx.events.emit(UiEvent::LocationChanged(sample.clone()));
                }
            }
        }));

        let online = self.online.clone();
        let ctx = self.ctx.clone();
        subscriptions.push(transport.subscribe(EventKind::OnlineCount, move |event| {
            if let ServerEvent::OnlineCount { count } = event {
                online.store(*count, Ordering::Relaxed);
                ctx.events.emit(UiEvent::OnlineCount { count: *count });
            }
        }));

        debug!(count = subscriptions.len(), "Push handlers installed");
    }

    fn remove_handlers(&self) {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .lock()
            .map(|mut subscriptions| subscriptions.drain(..).collect())
            .unwrap_or_default();
        for id in ids {
            self.ctx.transport.unsubscribe(id);
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn abort_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    pub fn notifications(&self) -> &Arc<NotificationAggregator> {
        &self.notifications
    }

    pub fn location(&self) -> Option<&LocationBroadcaster> {
        self.location.as_ref()
    }

    pub fn board(&self) -> &Arc<LocationBoard> {
        &self.board
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.ctx.transport
    }

    /// Company members connected to the hub, as last reported.
    pub fn online_count(&self) -> u64 {
        self.online.load(Ordering::Relaxed)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UiEvent> {
        self.ctx.events.subscribe()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.abort_tasks();
        // handlers hold the stores, which hold the transport
        self.remove_handlers();
    }
}

fn spawn_directory_refresh(directory: Arc<RoomDirectory>, notifications: Arc<NotificationAggregator>) {
    tokio::spawn(async move {
        match directory.refresh().await {
            Ok(rooms) => notifications.seed_unread(&rooms),
            Err(e) => warn!(error = %e, "Room directory refresh failed"),
        }
    });
}

/// Retry an initial connect that failed as unreachable.
async fn retry_connect(
    transport: Arc<Transport>,
    credential: Credential,
    backoff: Backoff,
    max_attempts: Option<u32>,
) {
    let mut attempt = 0u32;
    loop {
        if max_attempts.map_or(false, |max| attempt >= max) {
            warn!(attempts = attempt, "Giving up on push channel");
            return;
        }
        tokio::time::sleep(backoff.delay(attempt)).await;
        attempt += 1;

        match transport.connect(credential.clone()).await {
            Ok(()) => {
                info!(attempt, "Push channel connected after retry");
                return;
            }
            // the state watcher reports the rejection
            Err(TransportError::AuthRejected(_)) => return,
            Err(e) => debug!(attempt, error = %e, "Connect retry failed"),
        }
    }
}

async fn watch_connection(
    ctx: Arc<ClientContext>,
    directory: Arc<RoomDirectory>,
    mut state_rx: watch::Receiver<ConnectionState>,
) {
    while state_rx.changed().await.is_ok() {
        let state = state_rx.borrow_and_update().clone();
        ctx.events.emit(UiEvent::ConnectionChanged(state.clone()));
        match state {
            ConnectionState::Connected => {
                let rooms = directory.rejoin_all();
                debug!(rooms, "Rooms rejoined");
            }
            ConnectionState::Rejected => ctx.events.emit(UiEvent::AuthRequired {
                reason: "push channel refused the credential".into(),
            }),
            _ => {}
        }
    }
}

async fn poll_notifications(notifications: Arc<NotificationAggregator>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately; start already fetched
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = notifications.refresh().await {
            warn!(error = %e, "Notification poll failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewsync_net::{MemoryConnector, MemoryPeer, MemoryServer};
    use crewsync_shared::{ClientEvent, CompanyId, LocationSample, Role, RoomId, RoomKind, UserId};

    use crate::services::BearerToken;
    use crate::testing::{self, FakeBackend};

    fn client(backend: &Arc<FakeBackend>) -> (SyncClient, MemoryServer) {
        let (connector, server) = MemoryConnector::pair();
        let services = Services::from_backend(backend.clone(), Arc::new(BearerToken::new()));
        let client = SyncClient::new(
            testing::test_config(),
            Arc::new(connector),
            services,
            Database::open_in_memory().unwrap(),
            None,
        );
        (client, server)
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn signed_in(backend: &Arc<FakeBackend>) -> (SyncClient, MemoryServer, MemoryPeer) {
        let (client, mut server) = client(backend);
        let (result, peer) = tokio::join!(client.login(testing::login(Role::Foreman)), async {
            let mut peer = server.accept().await.unwrap();
            peer.complete_handshake().await.unwrap();
            peer
        });
        result.unwrap();
        (client, server, peer)
    }

    fn with_rooms(ids: &[&str]) -> Arc<FakeBackend> {
        let backend = FakeBackend::new();
        let rooms = ids
            .iter()
            .map(|id| testing::room(id, RoomKind::ProjectGroup))
            .collect();
        backend.set(|s| s.rooms = rooms);
        backend
    }

    #[tokio::test]
    async fn test_login_joins_every_room() {
        let backend = with_rooms(&["r1", "r2"]);
        let (client, _server, mut peer) = signed_in(&backend).await;

        let mut joined = Vec::new();
        for _ in 0..2 {
            match peer.recv().await.unwrap() {
                ClientEvent::JoinRoom { room_id } => joined.push(room_id),
                other => panic!("unexpected {other:?}"),
            }
        }
        joined.sort();
        assert_eq!(joined, vec![RoomId::from("r1"), RoomId::from("r2")]);
        assert_eq!(client.transport().state(), ConnectionState::Connected);
        assert_eq!(client.session().current().unwrap().role, Role::Foreman);
    }

    async fn joined_rooms(peer: &mut MemoryPeer, n: usize) -> Vec<RoomId> {
        let mut joined = Vec::new();
        while joined.len() < n {
            let event = tokio::time::timeout(Duration::from_secs(2), peer.recv())
                .await
                .unwrap()
                .unwrap();
            if let ClientEvent::JoinRoom { room_id } = event {
                joined.push(room_id);
            }
        }
        joined.sort();
        joined
    }

    #[tokio::test]
    async fn test_reconnect_rejoins_every_room() {
        let backend = with_rooms(&["r1", "r2"]);
        let (client, mut server, mut peer) = signed_in(&backend).await;
        let expected = vec![RoomId::from("r1"), RoomId::from("r2")];
        assert_eq!(joined_rooms(&mut peer, 2).await, expected);

        drop(peer);

        let mut replacement = tokio::time::timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        replacement.complete_handshake().await.unwrap();

        assert_eq!(joined_rooms(&mut replacement, 2).await, expected);
        eventually(|| client.transport().state() == ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_pushed_events_reach_components() {
        let backend = with_rooms(&["r1", "r2"]);
        let (client, _server, peer) = signed_in(&backend).await;

        peer.send(&ServerEvent::NewMessage {
            room_id: RoomId::from("r2"),
            message: testing::pushed("r2", "m1", "u-worker", "Rebar delivered"),
        });
        peer.send(&ServerEvent::PermissionInvalidation {
            role: Role::Foreman,
        });
        peer.send(&ServerEvent::OnlineCount { count: 3 });
        peer.send(&ServerEvent::LocationUpdate(LocationSample {
            user_id: UserId::from("u-worker"),
            lat: 45.5,
            lng: -73.6,
            company_id: CompanyId::from(testing::COMPANY),
            observed_at: chrono::Utc::now(),
        }));

        let r2 = RoomId::from("r2");
        eventually(|| client.context().unread.get(&r2) == 1).await;
        assert_eq!(client.channel().log(&r2).len(), 1);
        eventually(|| client.online_count() == 3).await;
        eventually(|| client.board().len() == 1).await;
        eventually(|| backend.read(|s| s.permission_calls == vec![Role::Foreman])).await;
    }

    #[tokio::test]
    async fn test_message_for_unknown_room_refreshes_directory() {
        let backend = with_rooms(&["r1"]);
        let (client, _server, peer) = signed_in(&backend).await;

        backend.set(|s| s.rooms.push(testing::room("r9", RoomKind::Direct)));
        peer.send(&ServerEvent::NewMessage {
            room_id: RoomId::from("r9"),
            message: testing::pushed("r9", "m5", "u-client", "Can we meet Friday?"),
        });

        let r9 = RoomId::from("r9");
        eventually(|| client.directory().contains(&r9)).await;
        assert_eq!(client.channel().log(&r9).len(), 1);
    }

    #[tokio::test]
    async fn test_new_room_push_is_inserted() {
        let backend = with_rooms(&["r1"]);
        let (client, _server, peer) = signed_in(&backend).await;

        let mut room = testing::room("dm-7", RoomKind::Direct);
        room.unread_count = 2;
        peer.send(&ServerEvent::NewRoom { room });

        let id = RoomId::from("dm-7");
        eventually(|| client.directory().contains(&id)).await;
        assert_eq!(client.context().unread.get(&id), 2);
    }

    #[tokio::test]
    async fn test_auth_rejected_at_connect_requires_sign_in() {
        let backend = with_rooms(&[]);
        let (client, mut server) = client(&backend);
        let mut events = client.subscribe_events();

        let (result, _peer) = tokio::join!(client.login(testing::login(Role::Foreman)), async {
            let mut peer = server.accept().await.unwrap();
            peer.recv().await.unwrap();
            peer.send(&ServerEvent::AuthRejected {
                reason: "token revoked".into(),
            });
            peer
        });

        assert!(matches!(result, Err(SyncError::AuthRejected(_))));
        let mut saw_auth_required = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, UiEvent::AuthRequired { .. }) {
                saw_auth_required = true;
            }
        }
        assert!(saw_auth_required);
    }

    #[tokio::test]
    async fn test_logout_releases_everything() {
        let backend = with_rooms(&["r1"]);
        let (client, _server, mut peer) = signed_in(&backend).await;

        client.logout().await.unwrap();

        // the link closes once pending joins are drained
        while peer.recv().await.is_some() {}
        assert_eq!(client.transport().state(), ConnectionState::Disconnected);
        assert!(client.session().current().is_none());
        assert!(client.directory().rooms().is_empty());
        assert!(client.context().services.bearer.get().is_none());
        assert!(client.resume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_keeps_session_for_resume() {
        let backend = with_rooms(&["r1"]);
        let (client, mut server, _peer) = signed_in(&backend).await;

        client.shutdown().await;
        assert!(!client.transport().is_running());

        let (resumed, _peer) = tokio::join!(client.resume(), async {
            let mut peer = server.accept().await.unwrap();
            peer.complete_handshake().await.unwrap();
            peer
        });
        let session = resumed.unwrap().unwrap();
        assert_eq!(session.user_id, UserId::from(testing::ME));
        assert_eq!(client.context().services.bearer.get().as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_resume_without_credential() {
        let backend = FakeBackend::new();
        let (client, _server) = client(&backend);
        assert!(client.resume().await.unwrap().is_none());
    }
}
