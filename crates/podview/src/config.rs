//! Configuration constants for the podview engine

/// Attempt timing for a single stream controller
pub mod timeouts {
    /// Maximum wait for the first frame of an attempt (milliseconds)
    pub const LOAD_TIMEOUT_MS: u64 = 20_000;

    /// Delay before the loading panel replaces the last visible panel (milliseconds)
    pub const SPINNER_REVEAL_MS: u64 = 5_000;

    /// Delay between the warmup hint and the first attempt (milliseconds)
    pub const WARMUP_DELAY_MS: u64 = 1_000;
}

/// Retry and backoff
pub mod retry {
    /// Attempts allowed before the controller gives up and shows the error panel
    pub const MAX_RETRIES: u32 = 5;

    /// First backoff delay (milliseconds)
    pub const INITIAL_DELAY_MS: u64 = 2_000;

    /// Backoff growth factor applied after each failure
    pub const BACKOFF_FACTOR: f64 = 1.5;

    /// Upper bound for the backoff delay (milliseconds)
    pub const MAX_DELAY_MS: u64 = 30_000;
}

/// Background health monitoring
pub mod health {
    /// Period of the empty-payload stall probe (milliseconds)
    pub const STALL_PROBE_INTERVAL_MS: u64 = 10_000;

    /// Period of the health check (milliseconds)
    pub const HEALTH_CHECK_INTERVAL_MS: u64 = 45_000;

    /// Period of the shared multi-feed sweep (milliseconds)
    pub const SWEEP_INTERVAL_MS: u64 = 120_000;
}

/// Network-related configuration
pub mod network {
    /// User agent for HTTP requests
    pub const USER_AGENT: &str = concat!("podview/", env!("CARGO_PKG_VERSION"));

    /// Connection timeout in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Per-read timeout for stream bodies in seconds
    pub const READ_TIMEOUT_SECS: u64 = 30;

    /// Timeout for warmup and relay-status requests in seconds
    pub const MONITOR_TIMEOUT_SECS: u64 = 5;

    /// Query parameter carrying the cache-defeating timestamp
    pub const CACHE_BUSTER_PARAM: &str = "t";
}

/// Multipart JPEG parsing
pub mod mjpeg {
    /// Maximum pending bytes before the parse buffer is trimmed
    pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

    /// Bytes kept (from the tail) when the parse buffer is trimmed
    pub const BUFFER_TRIM_SIZE: usize = 1024 * 1024;

    /// Chunk size for reading the response body
    pub const READ_CHUNK_SIZE: usize = 8 * 1024;

    /// Maximum size of a part header block
    pub const MAX_PART_HEADER_SIZE: usize = 8 * 1024;
}

/// Delayed frame cache
pub mod cache {
    /// How long received frames are kept (milliseconds)
    pub const CACHE_DURATION_MS: u64 = 15_000;

    /// How far behind the newest frame the served frame runs (milliseconds)
    pub const SERVE_DELAY_MS: u64 = 2_000;
}

/// Engine driver
pub mod engine {
    /// Longest the driver sleeps when no deadline is pending (milliseconds)
    pub const IDLE_POLL_MS: u64 = 500;

    /// Interval for refreshing shared stats (milliseconds)
    pub const STATS_REFRESH_MS: u64 = 500;
}
