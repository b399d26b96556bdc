//! Client side of the crewsync real-time core.
//!
//! [`SyncClient`] owns one signed-in session: it connects the push channel,
//! routes pushed events to the session, room, message, notification and
//! location components, and publishes [`UiEvent`]s for the presentation
//! layer.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod http;
pub mod location;
pub mod notifications;
pub mod rooms;
pub mod services;
pub mod session;
pub mod unread;

#[cfg(test)]
mod testing;

use tracing_subscriber::{fmt, EnvFilter};

pub use bridge::SyncClient;
pub use channel::{MessageChannel, Reconcile};
pub use config::ClientConfig;
pub use context::ClientContext;
pub use error::{Result, ServiceError, SyncError};
pub use events::{EventBus, UiEvent};
pub use http::HttpBackend;
pub use location::{LocationBoard, LocationBroadcaster, Position, PositionSource, StaticPosition};
pub use notifications::{ChatOutcome, NotificationAggregator};
pub use rooms::{Categories, Category, DirectoryView, RoomDirectory, Tab};
pub use services::{
    AuthorizationService, BearerToken, MessageService, NotificationService, RoomService, Services,
};
pub use session::{InvalidationOutcome, SessionStore};

/// Install the fmt subscriber, honoring `RUST_LOG`. Safe to call twice.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("crewsync_client=debug,crewsync_net=debug,crewsync_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
