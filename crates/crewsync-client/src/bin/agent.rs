//! # crewsync-agent
//!
//! Headless sync client. Resumes the session persisted on this machine,
//! keeps the push channel open and logs every UI event until Ctrl+C.
//! With `CREWSYNC_SITE_POSITION` set it also reports that fixed position,
//! which is how site beacons and gate terminals share their location.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crewsync_client::{
    init_tracing, BearerToken, ClientConfig, HttpBackend, PositionSource, Services,
    StaticPosition, SyncClient, UiEvent,
};
use crewsync_net::WsConnector;
use crewsync_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing and configuration
    // -----------------------------------------------------------------------
    init_tracing();
    info!("Starting crewsync agent v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(api = %config.api_url, push = %config.push_url, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 2. Open the local store
    // -----------------------------------------------------------------------
    let db = match &config.db_path {
        Some(path) => Database::open_at(path),
        None => Database::new(),
    }
    .context("Failed to open local store")?;

    // -----------------------------------------------------------------------
    // 3. Collaborator services and push connector
    // -----------------------------------------------------------------------
    let bearer = Arc::new(BearerToken::new());
    let backend = HttpBackend::new(&config.api_url, config.request_timeout, bearer.clone())
        .context("Failed to build HTTP client")?;
    let services = Services::from_backend(Arc::new(backend), bearer);
    let connector = Arc::new(WsConnector::new(config.push_url.clone()));

    let source = config.site_position.map(|(lat, lng)| {
        info!(lat, lng, "Reporting fixed site position");
        Arc::new(StaticPosition::new(lat, lng)) as Arc<dyn PositionSource>
    });

    let client = SyncClient::new(config, connector, services, db, source);

    // -----------------------------------------------------------------------
    // 4. Resume the stored session
    // -----------------------------------------------------------------------
    let Some(session) = client.resume().await? else {
        bail!("No stored session on this machine; sign in with a client first");
    };
    info!(
        user = %session.user_id,
        role = %session.role,
        company = %session.company_id,
        "Session resumed"
    );

    // -----------------------------------------------------------------------
    // 5. Log UI events until Ctrl+C
    // -----------------------------------------------------------------------
    let mut events = client.subscribe_events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
            event = events.recv() => match event {
                Ok(UiEvent::AuthRequired { reason }) => {
                    warn!(%reason, "Credential refused, sign in again");
                    break;
                }
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = event.name(), payload = %json, "UI event"),
                    Err(e) => warn!(event = event.name(), error = %e, "Unserializable UI event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    info!("Agent stopped");
    Ok(())
}
