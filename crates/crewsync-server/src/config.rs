//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the hub can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crewsync_shared::constants::{APP_NAME, DEFAULT_HTTP_PORT};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8090`
    pub http_addr: SocketAddr,

    /// Human-readable name for this hub instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Bearer token backend services present to `POST /publish`.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (publish endpoint disabled).
    pub admin_token: Option<String>,

    /// JSON file listing `{token, user_id, company_id}` entries.
    /// Env: `TOKENS_PATH`
    /// Default: none, which accepts any bearer and trusts the registered
    /// identity (development only).
    pub tokens_path: Option<PathBuf>,

    /// Push `online-count` to the company on every connect/disconnect.
    /// Env: `PRESENCE_ENABLED` (true/false)
    /// Default: `true`
    pub presence_enabled: bool,

    /// How long a fresh socket may take to send `register-identity`.
    /// Env: `REGISTRATION_TIMEOUT_SECS`
    /// Default: `10`
    pub registration_timeout: Duration,

    /// Sustained client events per second per user.
    /// Env: `EVENTS_PER_SECOND`
    /// Default: `20`
    pub events_per_second: f64,

    /// Client event burst per user.
    /// Env: `EVENT_BURST`
    /// Default: `60`
    pub event_burst: f64,

    /// Sustained position updates per second per user, counted apart from
    /// other client events.
    /// Env: `LOCATION_PER_SECOND`
    /// Default: `1`
    pub location_per_second: f64,

    /// Position update burst per user.
    /// Env: `LOCATION_BURST`
    /// Default: `5`
    pub location_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: format!("{APP_NAME} hub"),
            admin_token: None,
            tokens_path: None,
            presence_enabled: true,
            registration_timeout: Duration::from_secs(10),
            events_per_second: 20.0,
            event_burst: 60.0,
            location_per_second: 1.0,
            location_burst: 5.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(path) = lookup("TOKENS_PATH") {
            if !path.is_empty() {
                config.tokens_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = lookup("PRESENCE_ENABLED") {
            config.presence_enabled = val != "false" && val != "0";
        }

        if let Some(val) = lookup("REGISTRATION_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.registration_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid REGISTRATION_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("EVENTS_PER_SECOND") {
            match val.parse::<f64>() {
                Ok(rate) if rate > 0.0 => config.events_per_second = rate,
                _ => tracing::warn!(value = %val, "Invalid EVENTS_PER_SECOND, using default"),
            }
        }

        if let Some(val) = lookup("EVENT_BURST") {
            match val.parse::<f64>() {
                Ok(burst) if burst >= 1.0 => config.event_burst = burst,
                _ => tracing::warn!(value = %val, "Invalid EVENT_BURST, using default"),
            }
        }

        if let Some(val) = lookup("LOCATION_PER_SECOND") {
            match val.parse::<f64>() {
                Ok(rate) if rate > 0.0 => config.location_per_second = rate,
                _ => tracing::warn!(value = %val, "Invalid LOCATION_PER_SECOND, using default"),
            }
        }

        if let Some(val) = lookup("LOCATION_BURST") {
            match val.parse::<f64>() {
                Ok(burst) if burst >= 1.0 => config.location_burst = burst,
                _ => tracing::warn!(value = %val, "Invalid LOCATION_BURST, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
