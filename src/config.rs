//! Configuration management for rigpool
//!
//! Unified TOML configuration with multi-source loading and zero-config
//! defaults: an empty or missing file yields a working single-host setup.
//! Durations are written human-style ("20m", "4h") via humantime.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::cache::CacheConfig;
use crate::app::lease::{PoolConfig, StaticReservation};
use crate::app::resolver::ResolverConfig;
use crate::app::ClientConfig;
use crate::constants::{cache, http, leases, rpc};
use crate::errors::{ConfigError, ConfigResult};

/// Unified application configuration for TOML serialization
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Shared cache settings
    pub cache: CacheConfigToml,
    /// HTTP transport settings
    pub client: ClientConfigToml,
    /// Name resolution settings
    pub resolver: ResolverConfigToml,
    /// Lease allocation settings
    pub leases: LeasesConfigToml,
    /// Reservation RPC settings
    pub rpc: RpcConfigToml,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// TOML-friendly cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfigToml {
    /// Shared cache root (leave unset for the per-user default)
    pub shared_root: Option<PathBuf>,
    /// Overflow root for large artifacts; must be a distinct mount to be used
    pub overflow_root: Option<PathBuf>,
    /// Artifacts over this many bytes go to the overflow root
    pub overflow_threshold: u64,
    /// Poll interval while waiting on another owner's fetch
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Wait budget for fetches into the primary cache
    #[serde(with = "humantime_serde")]
    pub primary_wait_timeout: Duration,
    /// Wait budget for fetches into the overflow cache
    #[serde(with = "humantime_serde")]
    pub overflow_wait_timeout: Duration,
    /// Age in days after which cleanup removes unused entries
    pub cleanup_age_days: u64,
    /// Job identifier recorded in fetch markers
    pub job_id: Option<String>,
    /// Job-status endpoint used to detect dead fetch-marker owners
    pub job_status_url: Option<String>,
}

impl Default for CacheConfigToml {
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
            job_status_url: None,
        }
    }
}

/// TOML-friendly transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfigToml {
    /// Optional HTTP proxy applied to all requests
    pub proxy: Option<String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Connection pool idle timeout in seconds (unset = no timeout)
    pub pool_idle_timeout_secs: Option<u64>,
    /// Maximum connections per host
    pub pool_max_per_host: usize,
    /// Rate limit (requests per second)
    pub rate_limit_rps: u32,
    /// Listing depth for multi-file pattern fetches
    pub multi_file_depth: u32,
}

impl Default for ClientConfigToml {
    fn default() -> Self {
        Self {
            proxy: None,
            request_timeout: http::DEFAULT_TIMEOUT,
            connect_timeout: http::CONNECT_TIMEOUT,
            pool_idle_timeout_secs: Some(http::POOL_IDLE_TIMEOUT.as_secs()),
            pool_max_per_host: http::POOL_MAX_PER_HOST,
            rate_limit_rps: http::DEFAULT_RATE_LIMIT_RPS,
            multi_file_depth: cache::MULTI_FILE_LIST_DEPTH,
        }
    }
}

/// TOML-friendly resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResolverConfigToml {
    /// Values substituted for `${NAME}` placeholders
    pub variables: HashMap<String, String>,
    /// Base location for relative specifications
    pub input_dir: String,
    /// HTTP exporter prefix for protocol-less specifications
    pub http_export_prefix: String,
    /// Path segment treated as a "latest" alias
    pub latest_alias: Option<String>,
    /// Endpoint returning the concrete version for the latest alias
    pub latest_manifest_url: Option<String>,
    /// Live storage root
    pub live_root: Option<String>,
    /// Archive root substituted when the live root is unreachable
    pub archive_root: Option<String>,
}

/// TOML-friendly lease configuration: global defaults plus per-pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeasesConfigToml {
    /// Path to the lease database (unset = in-memory, non-durable)
    pub database: Option<PathBuf>,
    /// Default dynamic lease duration, overridable per pool
    #[serde(with = "humantime_serde")]
    pub lease_time: Duration,
    /// Default static-reservation lease duration, overridable per pool
    #[serde(with = "humantime_serde")]
    pub static_lease_time: Duration,
    /// Default MAC-prefix exclusions, overridable per pool
    pub mac_exclusions: Vec<String>,
    /// Address pools
    pub pools: Vec<PoolToml>,
}

impl Default for LeasesConfigToml {
    fn default() -> Self {
        Self {
            database: None,
            lease_time: leases::DEFAULT_LEASE_TIME,
            static_lease_time: leases::STATIC_LEASE_TIME,
            mac_exclusions: leases::DEFAULT_MAC_EXCLUSIONS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            pools: Vec::new(),
        }
    }
}

/// One configured address pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolToml {
    pub name: String,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    /// Overrides the global dynamic lease duration
    #[serde(default, with = "humantime_serde")]
    pub lease_time: Option<Duration>,
    /// Overrides the global static lease duration
    #[serde(default, with = "humantime_serde")]
    pub static_lease_time: Option<Duration>,
    /// Overrides the global MAC-prefix exclusions
    #[serde(default)]
    pub mac_exclusions: Option<Vec<String>>,
    /// Static reservations keyed by MAC
    #[serde(default)]
    pub reservations: HashMap<String, StaticReservation>,
}

/// TOML-friendly RPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfigToml {
    /// Bind address for the reservation API
    pub bind_addr: String,
}

impl Default for RpcConfigToml {
    fn default() -> Self {
        Self {
            bind_addr: rpc::DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level for the application
    pub level: String,
    /// Enable colored output
    pub colored_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            colored_output: true,
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, overlaid by the config file if one exists
    pub async fn load(config_file_override: Option<PathBuf>) -> ConfigResult<Self> {
        let config_path = match config_file_override {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound { path });
                }
                Some(path)
            }
            None => Self::find_config_file(),
        };

        match config_path {
            Some(path) => Self::load_from_file(&path).await,
            None => Ok(Self::default()),
        }
    }

    /// Find a configuration file in the standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut search_paths = vec![PathBuf::from("./rigpool.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("rigpool").join("config.toml"));
        }
        #[cfg(unix)]
        search_paths.push(PathBuf::from("/etc/rigpool/config.toml"));

        for path in search_paths {
            if path.exists() {
                debug!("Found config file: {}", path.display());
                return Some(path);
            }
        }
        debug!("No config file found in standard locations");
        None
    }

    /// Load configuration from a TOML file
    async fn load_from_file(path: &PathBuf) -> ConfigResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Convert to the runtime pool configurations, validating bounds
    pub fn to_pool_configs(&self) -> ConfigResult<Vec<PoolConfig>> {
        self.leases
            .pools
            .iter()
            .map(|pool| {
                let config = PoolConfig {
                    name: pool.name.clone(),
                    start: pool.start,
                    end: pool.end,
                    lease_time: pool.lease_time.unwrap_or(self.leases.lease_time),
                    static_lease_time: pool
                        .static_lease_time
                        .unwrap_or(self.leases.static_lease_time),
                    static_reservations: pool
                        .reservations
                        .iter()
                        .map(|(mac, r)| (mac.to_ascii_lowercase(), r.clone()))
                        .collect(),
                    mac_exclusions: pool
                        .mac_exclusions
                        .clone()
                        .unwrap_or_else(|| self.leases.mac_exclusions.clone()),
                };
                config.validate()?;
                Ok(config)
            })
            .collect()
    }
}

impl CacheConfigToml {
    /// Convert to runtime CacheConfig
    pub fn to_runtime_config(&self) -> CacheConfig {
        CacheConfig {
            shared_root: self.shared_root.clone(),
            overflow_root: self.overflow_root.clone(),
            overflow_threshold: self.overflow_threshold,
            poll_interval: self.poll_interval,
            primary_wait_timeout: self.primary_wait_timeout,
            overflow_wait_timeout: self.overflow_wait_timeout,
            cleanup_age_days: self.cleanup_age_days,
            job_id: self.job_id.clone(),
        }
    }
}

impl ClientConfigToml {
    /// Convert to runtime ClientConfig
    pub fn to_runtime_config(&self) -> ClientConfig {
        ClientConfig {
            proxy: self.proxy.clone(),
            request_timeout: self.request_timeout,
            connect_timeout: self.connect_timeout,
            pool_idle_timeout: self.pool_idle_timeout_secs.map(Duration::from_secs),
            pool_max_per_host: self.pool_max_per_host,
            rate_limit_rps: self.rate_limit_rps,
            multi_file_depth: self.multi_file_depth,
        }
    }
}

impl ResolverConfigToml {
    /// Convert to runtime ResolverConfig
    pub fn to_runtime_config(&self) -> ResolverConfig {
        ResolverConfig {
            variables: self.variables.clone(),
            input_dir: self.input_dir.clone(),
            http_export_prefix: self.http_export_prefix.clone(),
            latest_alias: self.latest_alias.clone(),
            latest_manifest_url: self.latest_manifest_url.clone(),
            live_root: self.live_root.clone(),
            archive_root: self.archive_root.clone(),
        }
    }
}
