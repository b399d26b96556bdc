//! Per-room unread counters.
//!
//! Increments belong to the notification aggregator and the clear
//! transition to the message channel; both mutators are crate-private so
//! no other component can write a counter.

use std::collections::HashMap;
use std::sync::Mutex;

use crewsync_shared::RoomId;

#[derive(Debug, Default)]
pub struct UnreadCounters {
    counts: Mutex<HashMap<RoomId, u32>>,
}

impl UnreadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, room_id: &RoomId) -> u32 {
        self.counts
            .lock()
            .ok()
            .and_then(|counts| counts.get(room_id).copied())
            .unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts
            .lock()
            .map(|counts| counts.values().sum())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<RoomId, u32> {
        self.counts
            .lock()
            .map(|counts| counts.clone())
            .unwrap_or_default()
    }

    /// Returns the new count.
    pub(crate) fn increment(&self, room_id: &RoomId) -> u32 {
        let Ok(mut counts) = self.counts.lock() else {
            return 0;
        };
        let count = counts.entry(room_id.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Returns `true` if the counter was non-zero.
    pub(crate) fn clear(&self, room_id: &RoomId) -> bool {
        self.counts
            .lock()
            .map(|mut counts| counts.remove(room_id).unwrap_or(0) > 0)
            .unwrap_or(false)
    }

    /// Server-reported count from the room list.
    pub(crate) fn seed(&self, room_id: &RoomId, count: u32) {
        if let Ok(mut counts) = self.counts.lock() {
            if count == 0 {
                counts.remove(room_id);
            } else {
                counts.insert(room_id.clone(), count);
            }
        }
    }

    pub(crate) fn reset(&self) {
        if let Ok(mut counts) = self.counts.lock() {
            counts.clear();
        }
    }
}
