//! Per-user allowance for client events read off the push channel.
//!
//! Every user holds one allowance per [`Lane`], so a device streaming its
//! position cannot starve the same user's chat messages.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crewsync_shared::{ClientEvent, UserId};

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Chat,
    Location,
    /// Registration, joins and read acknowledgments.
    Control,
}

impl Lane {
    pub fn of(event: &ClientEvent) -> Self {
        match event {
            ClientEvent::SendMessage { .. } => Lane::Chat,
            ClientEvent::UpdateLocation { .. } => Lane::Location,
            ClientEvent::RegisterIdentity { .. }
            | ClientEvent::JoinRoom { .. }
            | ClientEvent::MarkRead { .. } => Lane::Control,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    pub per_second: f64,
    pub burst: f64,
}

struct Allowance {
    available: f64,
    updated: Instant,
}

impl Allowance {
    fn full(budget: Budget, now: Instant) -> Self {
        Self {
            available: budget.burst,
            updated: now,
        }
    }

    fn take(&mut self, budget: Budget, now: Instant) -> bool {
        let earned = now.saturating_duration_since(self.updated).as_secs_f64() * budget.per_second;
        self.available = (self.available + earned).min(budget.burst);
        self.updated = now;
        if self.available < 1.0 {
            return false;
        }
        self.available -= 1.0;
        true
    }
}

pub struct EventThrottle {
    events: Budget,
    location: Budget,
    allowances: Mutex<HashMap<(UserId, Lane), Allowance>>,
}

impl EventThrottle {
    /// `events` applies to the chat and control lanes separately,
    /// `location` to position updates.
    pub fn new(events: Budget, location: Budget) -> Self {
        Self {
            events,
            location,
            allowances: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            Budget {
                per_second: config.events_per_second,
                burst: config.event_burst,
            },
            Budget {
                per_second: config.location_per_second,
                burst: config.location_burst,
            },
        )
    }

    /// Spend one unit of `user`'s allowance for the event's lane.
    pub fn admit(&self, user: &UserId, event: &ClientEvent) -> bool {
        self.admit_at(user, Lane::of(event), Instant::now())
    }

    /// Drop allowances untouched for `idle`; they start full again on the
    /// next event. Returns how many were dropped.
    pub fn forget_idle(&self, idle: Duration) -> usize {
        self.forget_idle_at(idle, Instant::now())
    }

    fn budget(&self, lane: Lane) -> Budget {
        match lane {
            Lane::Location => self.location,
            Lane::Chat | Lane::Control => self.events,
        }
    }

    fn admit_at(&self, user: &UserId, lane: Lane, now: Instant) -> bool {
        let budget = self.budget(lane);
        self.allowances()
            .entry((user.clone(), lane))
            .or_insert_with(|| Allowance::full(budget, now))
            .take(budget, now)
    }

    fn forget_idle_at(&self, idle: Duration, now: Instant) -> usize {
        let mut allowances = self.allowances();
        let before = allowances.len();
        allowances.retain(|_, allowance| now.saturating_duration_since(allowance.updated) < idle);
        before - allowances.len()
    }

    fn allowances(&self) -> MutexGuard<'_, HashMap<(UserId, Lane), Allowance>> {
        self.allowances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
