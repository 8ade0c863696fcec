//! Cache configuration types and defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::cache;

/// Configuration for the shared artifact cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Primary shared cache root (OS-specific location if None)
    pub shared_root: Option<PathBuf>,
    /// Overflow root for large artifacts, typically a separate large mount
    pub overflow_root: Option<PathBuf>,
    /// Artifacts whose probed size exceeds this go to the overflow tier
    pub overflow_threshold: u64,
    /// Poll interval while waiting on another owner's fetch marker
    pub poll_interval: Duration,
    /// Wait budget for fetches into the primary tier
    pub primary_wait_timeout: Duration,
    /// Wait budget for fetches into the overflow tier
    pub overflow_wait_timeout: Duration,
    /// Age in days after which cleanup removes unused entries
    pub cleanup_age_days: u64,
    /// Job identifier recorded in fetch markers this process creates
    pub job_id: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shared_root: None,
            overflow_root: None,
            overflow_threshold: cache::OVERFLOW_SIZE_THRESHOLD,
            poll_interval: cache::WAIT_POLL_INTERVAL,
            primary_wait_timeout: cache::PRIMARY_WAIT_TIMEOUT,
            overflow_wait_timeout: cache::OVERFLOW_WAIT_TIMEOUT,
            cleanup_age_days: cache::CLEANUP_AGE_DAYS,
            job_id: None,
        }
    }
}

impl CacheConfig {
    /// Marker owner string recorded by this process
    pub fn marker_owner(&self) -> &str {
        self.job_id.as_deref().unwrap_or(cache::NO_JOB_OWNER)
    }
}
