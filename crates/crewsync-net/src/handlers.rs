//! Typed handler registry.
//!
//! Handlers run on the transport task and must not block: anything that
//! needs I/O spawns its own task. They are invoked in registration order.
//! Handlers should read state through the shared stores they hold an
//! `Arc` to, never through values captured at registration time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{trace, warn};

use crewsync_shared::{EventKind, ServerEvent};

pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.entries.write() {
            Ok(mut entries) => entries.push(Entry {
                id,
                kind,
                handler: Arc::new(handler),
            }),
            Err(e) => warn!(error = %e, "Handler registry lock poisoned"),
        }
        id
    }

    /// Returns `true` if a handler was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler registered for the event's kind.
    ///
    /// The registry lock is released before any handler runs, so handlers
    /// may subscribe or unsubscribe.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let kind = event.kind();
        let matching: Vec<Handler> = match self.entries.read() {
            Ok(entries) => entries
                .iter()
                .filter(|entry| entry.kind == kind)
                .map(|entry| entry.handler.clone())
                .collect(),
            Err(_) => return 0,
        };

        trace!(kind = ?kind, handlers = matching.len(), "Dispatching event");

        for handler in &matching {
            handler(event);
        }
        matching.len()
    }
}
