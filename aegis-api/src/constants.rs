use std::time::Duration;

/// How often the session actor pings its websocket peer.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long a client may go silent before its session is dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback store entries older than this are swept on the next write.
pub const STORE_ENTRY_TTL: Duration = Duration::from_secs(300);
