//! Application constants for rigpool
//!
//! Centralizes all constants used throughout the application, organized by
//! functional domain.

use std::time::Duration;

/// HTTP client configuration constants
pub mod http {
    use super::Duration;

    /// Default user agent for all HTTP requests
    pub const USER_AGENT: &str = "rigpool/0.1.0 (test-rig resource manager)";

    /// Default HTTP request timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Connection establishment timeout
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Connection pool idle timeout
    pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

    /// Maximum connections per host in pool
    pub const POOL_MAX_PER_HOST: usize = 8;

    /// Default rate limit for source requests (requests per second)
    pub const DEFAULT_RATE_LIMIT_RPS: u32 = 15;

    /// Download chunk size for streaming (8KB)
    pub const DOWNLOAD_CHUNK_SIZE: usize = 8 * 1024;
}

/// Cache layout and coordination constants
pub mod cache {
    use super::Duration;

    /// Suffix of the in-progress fetch marker file
    pub const FETCHING_SUFFIX: &str = ".fetching";

    /// Temporary file suffix for atomic publish
    pub const TEMP_FILE_SUFFIX: &str = ".part";

    /// Marker owner recorded when no job id is available
    pub const NO_JOB_OWNER: &str = "nojob";

    /// Local name suffix appended for whole-directory fetches
    pub const PACKED_DIR_SUFFIX: &str = "packeddir";

    /// Archive suffix for directory and multi-file artifacts
    pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

    /// Poll interval while waiting on another owner's fetch
    pub const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(15);

    /// Wait budget for fetches into the primary shared cache
    pub const PRIMARY_WAIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    /// Wait budget for fetches into the overflow cache (large artifacts)
    pub const OVERFLOW_WAIT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

    /// Artifacts over this size are routed to the overflow tier
    pub const OVERFLOW_SIZE_THRESHOLD: u64 = 4 * 1024 * 1024 * 1024;

    /// Default age after which cleanup removes unused entries
    pub const CLEANUP_AGE_DAYS: u64 = 7;

    /// Listing depth for multi-file pattern fetches
    pub const MULTI_FILE_LIST_DEPTH: u32 = 2;
}

/// Lease pool constants
pub mod leases {
    use super::Duration;

    /// Default dynamic lease duration
    pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(20 * 60);

    /// Lease duration for static reservations
    pub const STATIC_LEASE_TIME: Duration = Duration::from_secs(4 * 60 * 60);

    /// MAC prefixes excluded from dynamic allocation by default
    pub const DEFAULT_MAC_EXCLUSIONS: &[&str] = &["02:", "06:"];

    /// Hostname prefix for synthesized dynamic-lease hostnames
    pub const HOSTNAME_PREFIX: &str = "rig";
}

/// Reservation RPC server constants
pub mod rpc {
    /// Default loopback bind address for the reservation API
    pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:1500";

    /// Maximum accepted request line length in bytes
    pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
}

// Re-export commonly used constants for convenience
pub use cache::{FETCHING_SUFFIX, TEMP_FILE_SUFFIX};
pub use http::USER_AGENT;
