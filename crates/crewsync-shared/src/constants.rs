/// Application name
pub const APP_NAME: &str = "crewsync";

/// Wire protocol version advertised in `/info`
pub const PROTOCOL_VERSION: &str = "crewsync/1";

/// Upper bound on establishing the push channel (link + registration)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on a single permission refresh round-trip
pub const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 8_000;

/// Per-request timeout for the collaborator HTTP services
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// First reconnect delay; doubles per attempt
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 500;

/// Reconnect delay ceiling
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Fraction of the delay used as random jitter (+/-)
pub const RECONNECT_JITTER: f64 = 0.2;

/// Periodic notification re-fetch
pub const DEFAULT_NOTIFICATION_POLL_SECS: u64 = 60;

/// A location sample is forced when the device watch is silent this long
pub const DEFAULT_LOCATION_MAX_STALENESS_SECS: u64 = 30;

/// How many chat message ids the aggregator remembers for de-duplication
pub const SEEN_MESSAGE_WINDOW: usize = 512;

/// Capacity of the UI event broadcast channel
pub const UI_EVENT_CAPACITY: usize = 256;

/// Capacity of the transport command channel
pub const TRANSPORT_COMMAND_CAPACITY: usize = 256;

/// Default HTTP port of the push hub
pub const DEFAULT_HTTP_PORT: u16 = 8090;
