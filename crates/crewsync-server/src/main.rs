//! # crewsync-server
//!
//! Push hub for crewsync clients.
//!
//! This binary provides:
//! - **WebSocket push channel** (`/ws`) with bearer authentication and a
//!   `register-identity` handshake
//! - **Routing** of client events to rooms and companies, with the
//!   sender's temporary message id stripped for everyone else
//! - **Presence**: `online-count` per company on every connect/disconnect
//! - **Backend publish endpoint** (`POST /publish`) for permission
//!   invalidations, messages, notifications and new rooms
//! - **Per-user throttling** of client events, with position updates
//!   budgeted apart from chat

mod api;
mod auth;
mod config;
mod error;
mod hub;
mod socket;
mod throttle;

use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::auth::TokenRegistry;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,crewsync_server=debug")),
        )
        .init();

    info!("Starting crewsync push hub v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Load the token registry
    // -----------------------------------------------------------------------
    let tokens = match &config.tokens_path {
        Some(path) => {
            let registry = TokenRegistry::load(path)?;
            info!(count = registry.len(), path = %path.display(), "Token registry loaded");
            registry
        }
        None => {
            warn!("No TOKENS_PATH configured, accepting any bearer (development only)");
            TokenRegistry::open()
        }
    };
    if config.admin_token.is_none() {
        warn!("No ADMIN_TOKEN configured, POST /publish is disabled");
    }

    let http_addr = config.http_addr;
    let state = AppState::new(config, tokens);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Forget allowances of users silent for 10 minutes, checked every 5
    let throttle = state.throttle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let forgotten = throttle.forget_idle(Duration::from_secs(600));
            if forgotten > 0 {
                debug!(forgotten, "Idle event allowances dropped");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the hub (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Push hub failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
