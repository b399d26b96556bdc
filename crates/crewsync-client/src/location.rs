//! Position sharing: the producer side watches the device and pushes
//! samples to the company, the consumer side keeps the latest sample per
//! user.
//!
//! At most one watch is active per broadcaster. The watch task owns the
//! position stream and is stopped through a [`CancellationToken`] on every
//! exit path, including drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crewsync_shared::{ClientEvent, LocationSample, UserId};

use crate::context::ClientContext;
use crate::session::SessionStore;

/// One device fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    /// When the device took the fix, not when it was read.
    pub fixed_at: DateTime<Utc>,
}

impl Position {
    pub fn new(lat: f64, lng: f64, fixed_at: DateTime<Utc>) -> Self {
        Self { lat, lng, fixed_at }
    }

    /// A fix taken right now.
    pub fn now(lat: f64, lng: f64) -> Self {
        Self::new(lat, lng, Utc::now())
    }
}

/// Device seam.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// One-shot fix; `None` when no fix is available.
    async fn sample(&self) -> Option<Position>;

    /// Continuous updates until the stream is dropped.
    fn watch(&self) -> BoxStream<'static, Position>;
}

/// Fixed position, for stationary site beacons. Every sample is a fresh
/// fix of the same coordinates.
pub struct StaticPosition {
    lat: f64,
    lng: f64,
}

impl StaticPosition {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[async_trait]
impl PositionSource for StaticPosition {
    async fn sample(&self) -> Option<Position> {
        Some(Position::now(self.lat, self.lng))
    }

    fn watch(&self) -> BoxStream<'static, Position> {
        // never moves: the staleness timer re-sends the fix
        stream::pending().boxed()
    }
}

struct ActiveWatch {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LocationBroadcaster {
    ctx: Arc<ClientContext>,
    session: Arc<SessionStore>,
    source: Arc<dyn PositionSource>,
    active: Mutex<Option<ActiveWatch>>,
}

impl LocationBroadcaster {
    pub fn new(
        ctx: Arc<ClientContext>,
        session: Arc<SessionStore>,
        source: Arc<dyn PositionSource>,
    ) -> Self {
        Self {
            ctx,
            session,
            source,
            active: Mutex::new(None),
        }
    }

    /// Start tracking. Returns `false` (and does nothing) if a watch is
    /// already running.
    pub fn start(&self) -> bool {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if active.as_ref().map_or(false, |watch| !watch.task.is_finished()) {
            debug!("Location watch already active");
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_watch(
            self.ctx.clone(),
            self.session.clone(),
            self.source.clone(),
            cancel.clone(),
        ));
        *active = Some(ActiveWatch { cancel, task });
        info!("Location tracking started");
        true
    }

    /// Stop tracking. Idempotent; returns `true` if a watch was running.
    pub fn stop(&self) -> bool {
        let watch = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match watch {
            Some(watch) => {
                watch.cancel.cancel();
                info!("Location tracking stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map_or(false, |watch| !watch.task.is_finished())
    }
}

impl Drop for LocationBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_watch(
    ctx: Arc<ClientContext>,
    session: Arc<SessionStore>,
    source: Arc<dyn PositionSource>,
    cancel: CancellationToken,
) {
    let staleness = ctx.config.location_max_staleness;
    let mut last_fix = None;

    let baseline = tokio::select! {
        _ = cancel.cancelled() => return,
        fix = source.sample() => fix,
    };
    if let Some(position) = baseline {
        publish(&ctx, &session, &mut last_fix, position);
    }

    let mut updates = source.watch();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = updates.next() => match next {
                Some(position) => publish(&ctx, &session, &mut last_fix, position),
                None => {
                    debug!("Position source ended");
                    break;
                }
            },
            // restarted on every iteration, so it only fires after silence
            _ = tokio::time::sleep(staleness) => {
                if let Some(position) = source.sample().await {
                    publish(&ctx, &session, &mut last_fix, position);
                }
            }
        }
    }
    // the stream is dropped here, releasing the device watch
}

/// Push `position` unless it is no newer than the last pushed fix.
fn publish(
    ctx: &ClientContext,
    session: &SessionStore,
    last_fix: &mut Option<DateTime<Utc>>,
    position: Position,
) {
    if last_fix.map_or(false, |last| position.fixed_at <= last) {
        trace!(fixed_at = %position.fixed_at, "Fix not newer than the last one, skipped");
        return;
    }
    let Some(current) = session.current() else {
        return;
    };
    *last_fix = Some(position.fixed_at);
    ctx.emit(ClientEvent::UpdateLocation {
        lat: position.lat,
        lng: position.lng,
        company_id: current.company_id,
        observed_at: position.fixed_at,
    });
}

/// Latest known position of each company member.
#[derive(Default)]
pub struct LocationBoard {
    latest: RwLock<HashMap<UserId, LocationSample>>,
}

impl LocationBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the user's sample. Samples older than the held one are
    /// ignored; returns `true` if the board changed.
    pub fn apply(&self, sample: LocationSample) -> bool {
        let mut latest = self
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match latest.get(&sample.user_id) {
            Some(held) if held.observed_at > sample.observed_at => false,
            _ => {
                latest.insert(sample.user_id.clone(), sample);
                true
            }
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<LocationSample> {
        self.read().get(user_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<LocationSample> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<UserId, LocationSample>> {
        self.latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crewsync_net::MemoryPeer;
    use crewsync_shared::{CompanyId, Credential, Role};
    use tokio::sync::mpsc;

    use crate::testing::{self, FakeBackend};

    /// Source that counts how many watches were opened and lets the test
    /// feed positions into them.
    struct ScriptedSource {
        /// Returned by every one-shot sample.
        fix: Position,
        samples: AtomicUsize,
        watches: AtomicUsize,
        feeds: Mutex<Vec<mpsc::UnboundedSender<Position>>>,
    }

    impl ScriptedSource {
        fn new() -> Arc<Self> {
            Self::with_fix(Position::new(1.0, 2.0, Utc::now() - chrono::Duration::seconds(30)))
        }

        fn with_fix(fix: Position) -> Arc<Self> {
            Arc::new(Self {
                fix,
                samples: AtomicUsize::new(0),
                watches: AtomicUsize::new(0),
                feeds: Mutex::new(Vec::new()),
            })
        }

        fn feed(&self, position: Position) {
            for tx in self.feeds.lock().unwrap().iter() {
                let _ = tx.send(position);
            }
        }

        fn open_feeds(&self) -> usize {
            self.feeds
                .lock()
                .unwrap()
                .iter()
                .filter(|tx| !tx.is_closed())
                .count()
        }
    }

    #[async_trait]
    impl PositionSource for ScriptedSource {
        async fn sample(&self) -> Option<Position> {
            self.samples.fetch_add(1, Ordering::SeqCst);
            Some(self.fix)
        }

        fn watch(&self) -> BoxStream<'static, Position> {
            self.watches.fetch_add(1, Ordering::SeqCst);
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.feeds.lock().unwrap().push(tx);
            stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
        }
    }

    fn broadcaster(source: Arc<ScriptedSource>) -> LocationBroadcaster {
        let backend = FakeBackend::new();
        let (ctx, _server) = testing::test_context(&backend);
        let session = Arc::new(SessionStore::new(ctx.clone()));
        session.establish(&testing::login(Role::Foreman)).unwrap();
        LocationBroadcaster::new(ctx, session, source)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_second_start_is_a_noop() {
        let source = ScriptedSource::new();
        let tracker = broadcaster(source.clone());

        assert!(tracker.start());
        assert!(!tracker.start());
        settle().await;

        assert_eq!(source.watches.load(Ordering::SeqCst), 1);
        assert_eq!(source.open_feeds(), 1);
        assert!(tracker.is_active());
    }

    #[tokio::test]
    async fn test_stop_releases_watch_and_is_idempotent() {
        let source = ScriptedSource::new();
        let tracker = broadcaster(source.clone());

        tracker.start();
        settle().await;
        assert!(tracker.stop());
        assert!(!tracker.stop());
        settle().await;

        assert_eq!(source.open_feeds(), 0);
        assert!(!tracker.is_active());

        assert!(tracker.start());
        settle().await;
        assert_eq!(source.watches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drop_releases_watch() {
        let source = ScriptedSource::new();
        {
            let tracker = broadcaster(source.clone());
            tracker.start();
            settle().await;
            assert_eq!(source.open_feeds(), 1);
        }
        settle().await;
        assert_eq!(source.open_feeds(), 0);
    }

    #[tokio::test]
    async fn test_staleness_forces_fresh_sample() {
        let source = ScriptedSource::new();
        let tracker = broadcaster(source.clone());

        tracker.start();
        // baseline plus at least one staleness refresh (50ms in tests)
        tokio::time::sleep(Duration::from_millis(140)).await;
        assert!(source.samples.load(Ordering::SeqCst) >= 2);
        tracker.stop();
    }

    /// Broadcaster whose context is connected to a loopback hub.
    async fn connected(source: Arc<ScriptedSource>) -> (LocationBroadcaster, MemoryPeer) {
        let backend = FakeBackend::new();
        let (ctx, mut server) = testing::test_context(&backend);
        let session = Arc::new(SessionStore::new(ctx.clone()));
        session.establish(&testing::login(Role::Foreman)).unwrap();
        let credential = Credential {
            token: "tok-1".into(),
            user_id: UserId::from(testing::ME),
            company_id: CompanyId::from(testing::COMPANY),
        };
        let (result, peer) = tokio::join!(ctx.transport.connect(credential), async {
            let mut peer = server.accept().await.unwrap();
            peer.complete_handshake().await.unwrap();
            peer
        });
        result.unwrap();
        (LocationBroadcaster::new(ctx, session, source), peer)
    }

    async fn next_update(peer: &mut MemoryPeer) -> (f64, DateTime<Utc>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), peer.recv())
                .await
                .unwrap()
                .unwrap();
            if let ClientEvent::UpdateLocation {
                lat, observed_at, ..
            } = event
            {
                return (lat, observed_at);
            }
        }
    }

    #[tokio::test]
    async fn test_updates_carry_fix_time_and_skip_older_fixes() {
        let fixed_at = Utc::now() - chrono::Duration::seconds(30);
        let source = ScriptedSource::with_fix(Position::new(1.0, 2.0, fixed_at));
        let (tracker, mut peer) = connected(source.clone()).await;

        tracker.start();
        assert_eq!(next_update(&mut peer).await, (1.0, fixed_at));
        settle().await;

        let newer = fixed_at + chrono::Duration::seconds(20);
        source.feed(Position::new(3.0, 2.0, newer));
        assert_eq!(next_update(&mut peer).await, (3.0, newer));

        // delivered late, older than what the hub already has
        source.feed(Position::new(9.0, 2.0, fixed_at + chrono::Duration::seconds(10)));
        let newest = newer + chrono::Duration::seconds(5);
        source.feed(Position::new(4.0, 2.0, newest));
        assert_eq!(next_update(&mut peer).await, (4.0, newest));

        tracker.stop();
    }

    fn sample(user: &str, lat: f64, observed_at: DateTime<Utc>) -> LocationSample {
        LocationSample {
            user_id: UserId::from(user),
            lat,
            lng: 0.0,
            company_id: CompanyId::from(testing::COMPANY),
            observed_at,
        }
    }

    #[test]
    fn test_board_replaces_never_appends() {
        let board = LocationBoard::new();
        let now = Utc::now();

        assert!(board.apply(sample("u-1", 1.0, now)));
        assert!(board.apply(sample("u-1", 2.0, now + chrono::Duration::seconds(1))));
        assert!(board.apply(sample("u-2", 3.0, now)));
        assert_eq!(board.len(), 2);
        assert_eq!(board.get(&UserId::from("u-1")).unwrap().lat, 2.0);

        // out-of-order delivery of an older sample
        assert!(!board.apply(sample("u-1", 9.0, now)));
        assert_eq!(board.get(&UserId::from("u-1")).unwrap().lat, 2.0);
    }
}
