//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a client can start against a local
//! development stack with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use crewsync_net::{Backoff, TransportConfig};
use crewsync_shared::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_HTTP_PORT, DEFAULT_LOCATION_MAX_STALENESS_SECS,
    DEFAULT_NOTIFICATION_POLL_SECS, DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_MS,
    DEFAULT_REFRESH_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the collaborator HTTP services.
    /// Env: `CREWSYNC_API_URL`
    pub api_url: String,

    /// Push hub WebSocket endpoint.
    /// Env: `CREWSYNC_PUSH_URL`
    pub push_url: String,

    /// Warm-start cache location. `None` uses the platform data directory.
    /// Env: `CREWSYNC_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Env: `CREWSYNC_CONNECT_TIMEOUT_MS`
    pub connect_timeout: Duration,

    /// Env: `CREWSYNC_REQUEST_TIMEOUT_MS`
    pub request_timeout: Duration,

    /// Bound on one permission refresh round-trip.
    /// Env: `CREWSYNC_REFRESH_TIMEOUT_MS`
    pub refresh_timeout: Duration,

    /// Period of the notification re-fetch.
    /// Env: `CREWSYNC_NOTIFICATION_POLL_SECS`
    pub notification_poll_interval: Duration,

    /// A fresh position is forced when the watch has been silent this long.
    /// Env: `CREWSYNC_LOCATION_MAX_STALENESS_SECS`
    pub location_max_staleness: Duration,

    /// Env: `CREWSYNC_RECONNECT_BASE_MS`
    pub reconnect_base: Duration,

    /// Env: `CREWSYNC_RECONNECT_MAX_MS`
    pub reconnect_max: Duration,

    /// Env: `CREWSYNC_MAX_RECONNECT_ATTEMPTS` (0 = unlimited)
    pub max_reconnect_attempts: Option<u32>,

    /// Fixed position reported by a stationary agent, as `lat,lng`.
    /// Env: `CREWSYNC_SITE_POSITION`
    pub site_position: Option<(f64, f64)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080/api".to_string(),
            push_url: format!("ws://127.0.0.1:{DEFAULT_HTTP_PORT}/ws"),
            db_path: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            refresh_timeout: Duration::from_millis(DEFAULT_REFRESH_TIMEOUT_MS),
            notification_poll_interval: Duration::from_secs(DEFAULT_NOTIFICATION_POLL_SECS),
            location_max_staleness: Duration::from_secs(DEFAULT_LOCATION_MAX_STALENESS_SECS),
            reconnect_base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_reconnect_attempts: None,
            site_position: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("CREWSYNC_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }

        if let Some(url) = lookup("CREWSYNC_PUSH_URL") {
            config.push_url = url;
        }

        if let Some(path) = lookup("CREWSYNC_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        read_millis(&lookup, "CREWSYNC_CONNECT_TIMEOUT_MS", &mut config.connect_timeout);
        read_millis(&lookup, "CREWSYNC_REQUEST_TIMEOUT_MS", &mut config.request_timeout);
        read_millis(&lookup, "CREWSYNC_REFRESH_TIMEOUT_MS", &mut config.refresh_timeout);
        read_millis(&lookup, "CREWSYNC_RECONNECT_BASE_MS", &mut config.reconnect_base);
        read_millis(&lookup, "CREWSYNC_RECONNECT_MAX_MS", &mut config.reconnect_max);

        if let Some(val) = lookup("CREWSYNC_NOTIFICATION_POLL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.notification_poll_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid CREWSYNC_NOTIFICATION_POLL_SECS, using default"),
            }
        }

        if let Some(val) = lookup("CREWSYNC_LOCATION_MAX_STALENESS_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.location_max_staleness = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid CREWSYNC_LOCATION_MAX_STALENESS_SECS, using default"),
            }
        }

        if let Some(val) = lookup("CREWSYNC_MAX_RECONNECT_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(0) => config.max_reconnect_attempts = None,
                Ok(n) => config.max_reconnect_attempts = Some(n),
                Err(_) => tracing::warn!(value = %val, "Invalid CREWSYNC_MAX_RECONNECT_ATTEMPTS, using default"),
            }
        }

        if let Some(val) = lookup("CREWSYNC_SITE_POSITION") {
            match parse_position(&val) {
                Some(position) => config.site_position = Some(position),
                None => tracing::warn!(value = %val, "Invalid CREWSYNC_SITE_POSITION, expected `lat,lng`"),
            }
        }

        if config.reconnect_max < config.reconnect_base {
            tracing::warn!("CREWSYNC_RECONNECT_MAX_MS below base, clamping");
            config.reconnect_max = config.reconnect_base;
        }

        config
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout,
            backoff: self.backoff(),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_base, self.reconnect_max)
    }
}

fn read_millis<F>(lookup: &F, key: &str, target: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup(key) {
        match val.parse::<u64>() {
            Ok(ms) if ms > 0 => *target = Duration::from_millis(ms),
            _ => tracing::warn!(key, value = %val, "Invalid duration, using default"),
        }
    }
}

fn parse_position(value: &str) -> Option<(f64, f64)> {
    let (lat, lng) = value.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lng: f64 = lng.trim().parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)).then_some((lat, lng))
}
