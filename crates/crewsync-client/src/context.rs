//! Explicit per-session context handed to every component constructor.
//!
//! There is no global "current session": tests build as many isolated
//! contexts as they like.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crewsync_net::{Connector, Transport};
use crewsync_shared::ClientEvent;
use crewsync_store::Database;

use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::services::Services;
use crate::unread::UnreadCounters;

pub struct ClientContext {
    pub config: ClientConfig,
    pub transport: Arc<Transport>,
    pub services: Services,
    pub unread: UnreadCounters,
    pub events: EventBus,
    store: Mutex<Database>,
}

impl ClientContext {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        services: Services,
        store: Database,
    ) -> Arc<Self> {
        let transport = Arc::new(Transport::new(connector, config.transport_config()));
        Arc::new(Self {
            config,
            transport,
            services,
            unread: UnreadCounters::new(),
            events: EventBus::new(),
            store: Mutex::new(store),
        })
    }

    /// Run a synchronous store operation.
    pub(crate) fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> crewsync_store::Result<T>,
    {
        // a panic mid-statement leaves SQLite consistent, so poisoning is ignored
        let db = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&db).map_err(SyncError::from)
    }

    /// Fire-and-forget emit; failures only matter to the transport.
    pub(crate) fn emit(&self, event: ClientEvent) {
        let name = event.name();
        if let Err(e) = self.transport.emit(event) {
            debug!(event = name, error = %e, "Emit skipped");
        }
    }
}
