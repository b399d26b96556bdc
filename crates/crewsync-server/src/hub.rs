//! Connection registry and event routing.
//!
//! Every registered socket gets an unbounded queue drained by its writer
//! task, so routing never waits on a slow client. Routing is by scope:
//! one user (all of their devices), one room (every joined connection),
//! or one company.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crewsync_shared::{ClientEvent, CompanyId, LocationSample, Message, RoomId, ServerEvent, UserId};

use crate::auth::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    User(UserId),
    Room(RoomId),
    Company(CompanyId),
}

struct Connection {
    identity: Identity,
    rooms: HashSet<RoomId>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Scope {
    fn matches(&self, conn: &Connection) -> bool {
        match self {
            Scope::User(user) => conn.identity.user_id == *user,
            Scope::Room(room) => conn.rooms.contains(room),
            Scope::Company(company) => conn.identity.company_id == *company,
        }
    }
}

pub struct Hub {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    presence: bool,
}

impl Hub {
    pub fn new(presence: bool) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            presence,
        }
    }

    pub fn register(
        &self,
        identity: Identity,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let company = identity.company_id.clone();
        info!(user = %identity.user_id, company = %company, "Client registered");
        self.write().insert(
            id,
            Connection {
                identity,
                rooms: HashSet::new(),
                tx,
            },
        );
        self.announce_presence(&company);
        id
    }

    pub fn unregister(&self, id: ConnectionId) {
        let removed = self.write().remove(&id);
        if let Some(conn) = removed {
            info!(user = %conn.identity.user_id, "Client disconnected");
            self.announce_presence(&conn.identity.company_id);
        }
    }

    pub fn join(&self, id: ConnectionId, room_id: RoomId) {
        if let Some(conn) = self.write().get_mut(&id) {
            debug!(user = %conn.identity.user_id, room = %room_id, "Joined room");
            conn.rooms.insert(room_id);
        }
    }

    /// Deliver `event` to every connection in `scope`. Returns how many
    /// queues accepted it.
    pub fn publish(&self, scope: &Scope, event: &ServerEvent) -> usize {
        self.deliver(None, |conn| scope.matches(conn).then(|| event.clone()))
    }

    /// Route one event read from connection `origin`.
    pub fn handle(&self, origin: ConnectionId, event: ClientEvent) {
        let sender = self.read().get(&origin).map(|conn| conn.identity.clone());
        let Some(sender) = sender else {
            return;
        };

        match event {
            ClientEvent::RegisterIdentity { .. } => {
                debug!(user = %sender.user_id, "Repeated registration ignored");
            }
            ClientEvent::JoinRoom { room_id } => self.join(origin, room_id),
            ClientEvent::SendMessage { room_id, message } => {
                if message.sender_id != sender.user_id || message.room_id != room_id {
                    warn!(user = %sender.user_id, room = %room_id, "Forged message dropped");
                    return;
                }
                let delivered = self.fan_out_message(origin, &sender, &room_id, &message);
                debug!(room = %room_id, delivered, "Message fanned out");
            }
            ClientEvent::UpdateLocation {
                lat,
                lng,
                observed_at,
                ..
            } => {
                if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
                    warn!(user = %sender.user_id, lat, lng, "Out-of-range position dropped");
                    return;
                }
                // the company comes from the registration, never the payload
                let sample = LocationSample {
                    user_id: sender.user_id.clone(),
                    lat,
                    lng,
                    company_id: sender.company_id.clone(),
                    observed_at,
                };
                let scope = Scope::Company(sender.company_id);
                self.deliver(Some(origin), |conn| {
                    scope
                        .matches(conn)
                        .then(|| ServerEvent::LocationUpdate(sample.clone()))
                });
            }
            ClientEvent::MarkRead { scope } => {
                debug!(user = %sender.user_id, ?scope, "Read acknowledged");
            }
        }
    }

    /// Distinct users of `company` with at least one live connection.
    pub fn online_count(&self, company: &CompanyId) -> u64 {
        let connections = self.read();
        let users: HashSet<&UserId> = connections
            .values()
            .filter(|conn| conn.identity.company_id == *company)
            .map(|conn| &conn.identity.user_id)
            .collect();
        users.len() as u64
    }

    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    /// Room ids are only unique within a company, so a joined connection
    /// from another company never receives the message. The sender keeps
    /// its temporary id on its other devices; everybody else gets the
    /// confirmed message without it.
    fn fan_out_message(
        &self,
        origin: ConnectionId,
        sender: &Identity,
        room_id: &RoomId,
        message: &Message,
    ) -> usize {
        let stripped = message.without_temp_id();
        self.deliver(Some(origin), |conn| {
            if conn.identity.company_id != sender.company_id || !conn.rooms.contains(room_id) {
                return None;
            }
            let copy = if conn.identity.user_id == message.sender_id {
                message.clone()
            } else {
                stripped.clone()
            };
            Some(ServerEvent::NewMessage {
                room_id: room_id.clone(),
                message: copy,
            })
        })
    }

    fn announce_presence(&self, company: &CompanyId) {
        if !self.presence {
            return;
        }
        let count = self.online_count(company);
        self.publish(
            &Scope::Company(company.clone()),
            &ServerEvent::OnlineCount { count },
        );
    }

    fn deliver<F>(&self, skip: Option<ConnectionId>, mut event_for: F) -> usize
    where
        F: FnMut(&Connection) -> Option<ServerEvent>,
    {
        let connections = self.read();
        let mut delivered = 0;
        for (id, conn) in connections.iter() {
            if Some(*id) == skip {
                continue;
            }
            if let Some(event) = event_for(conn) {
                if conn.tx.send(event).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crewsync_shared::{DeliveryState, Role, TempId};

    fn connect(hub: &Hub, user: &str, company: &str) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub.register(
            Identity {
                user_id: UserId::from(user),
                company_id: CompanyId::from(company),
            },
            tx,
        );
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn confirmed(room: &str, sender: &str, temp: TempId) -> Message {
        Message {
            id: Some("m1".into()),
            client_temp_id: Some(temp),
            room_id: RoomId::from(room),
            sender_id: UserId::from(sender),
            sender_display: sender.to_string(),
            body: "Pour starts at 7".into(),
            attachments: Vec::new(),
            created_at: Utc::now(),
            delivery_state: DeliveryState::Confirmed,
        }
    }

    #[test]
    fn test_publish_by_scope() {
        let hub = Hub::new(false);
        let (a, mut rx_a) = connect(&hub, "u-a", "acme");
        let (_b, mut rx_b) = connect(&hub, "u-b", "acme");
        let (_c, mut rx_c) = connect(&hub, "u-c", "other");
        hub.join(a, RoomId::from("r1"));

        let invalidation = ServerEvent::PermissionInvalidation { role: Role::Worker };
        assert_eq!(hub.publish(&Scope::Company(CompanyId::from("acme")), &invalidation), 2);
        assert_eq!(hub.publish(&Scope::User(UserId::from("u-c")), &invalidation), 1);
        assert_eq!(hub.publish(&Scope::Room(RoomId::from("r1")), &invalidation), 1);

        assert_eq!(drain(&mut rx_a).len(), 2);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(drain(&mut rx_c).len(), 1);
    }

    #[test]
    fn test_message_fan_out_strips_temp_id_for_others() {
        let hub = Hub::new(false);
        let (phone, mut rx_phone) = connect(&hub, "u-a", "acme");
        let (tablet, mut rx_tablet) = connect(&hub, "u-a", "acme");
        let (b, mut rx_b) = connect(&hub, "u-b", "acme");
        let (_c, mut rx_c) = connect(&hub, "u-c", "acme");
        for id in [phone, tablet, b] {
            hub.join(id, RoomId::from("r1"));
        }

        let temp = TempId::new();
        hub.handle(
            phone,
            ClientEvent::SendMessage {
                room_id: RoomId::from("r1"),
                message: confirmed("r1", "u-a", temp),
            },
        );

        assert!(drain(&mut rx_phone).is_empty());
        assert!(drain(&mut rx_c).is_empty());
        match drain(&mut rx_tablet).as_slice() {
            [ServerEvent::NewMessage { message, .. }] => {
                assert_eq!(message.client_temp_id, Some(temp))
            }
            other => panic!("unexpected {other:?}"),
        }
        match drain(&mut rx_b).as_slice() {
            [ServerEvent::NewMessage { message, .. }] => assert!(message.client_temp_id.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_room_fan_out_stays_within_company() {
        let hub = Hub::new(false);
        let (a, _rx_a) = connect(&hub, "u-a", "acme");
        let (b, mut rx_b) = connect(&hub, "u-b", "acme");
        let (spy, mut rx_spy) = connect(&hub, "u-spy", "rival");
        for id in [a, b, spy] {
            hub.handle(id, ClientEvent::JoinRoom { room_id: RoomId::from("r1") });
        }

        hub.handle(
            a,
            ClientEvent::SendMessage {
                room_id: RoomId::from("r1"),
                message: confirmed("r1", "u-a", TempId::new()),
            },
        );

        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(drain(&mut rx_spy).is_empty());
    }

    #[test]
    fn test_forged_sender_is_dropped() {
        let hub = Hub::new(false);
        let (a, _rx_a) = connect(&hub, "u-a", "acme");
        let (b, mut rx_b) = connect(&hub, "u-b", "acme");
        hub.join(a, RoomId::from("r1"));
        hub.join(b, RoomId::from("r1"));

        hub.handle(
            a,
            ClientEvent::SendMessage {
                room_id: RoomId::from("r1"),
                message: confirmed("r1", "u-b", TempId::new()),
            },
        );
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_location_uses_registered_company() {
        let hub = Hub::new(false);
        let (a, mut rx_a) = connect(&hub, "u-a", "acme");
        let (_b, mut rx_b) = connect(&hub, "u-b", "acme");
        let (_c, mut rx_c) = connect(&hub, "u-c", "other");

        hub.handle(
            a,
            ClientEvent::UpdateLocation {
                lat: 45.5,
                lng: -73.6,
                company_id: CompanyId::from("other"),
                observed_at: Utc::now(),
            },
        );

        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_c).is_empty());
        match drain(&mut rx_b).as_slice() {
            [ServerEvent::LocationUpdate(sample)] => {
                assert_eq!(sample.company_id, CompanyId::from("acme"));
                assert_eq!(sample.user_id, UserId::from("u-a"));
            }
            other => panic!("unexpected {other:?}"),
        }

        hub.handle(
            a,
            ClientEvent::UpdateLocation {
                lat: 123.0,
                lng: 0.0,
                company_id: CompanyId::from("acme"),
                observed_at: Utc::now(),
            },
        );
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_presence_counts_distinct_users() {
        let hub = Hub::new(true);
        let (_a1, mut rx_a1) = connect(&hub, "u-a", "acme");
        let (_a2, _rx_a2) = connect(&hub, "u-a", "acme");
        let (b, _rx_b) = connect(&hub, "u-b", "acme");
        assert_eq!(hub.online_count(&CompanyId::from("acme")), 2);
        assert_eq!(hub.connection_count(), 3);

        hub.unregister(b);
        assert_eq!(hub.online_count(&CompanyId::from("acme")), 1);

        let counts: Vec<u64> = drain(&mut rx_a1)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::OnlineCount { count } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 1, 2, 1]);
    }
}
