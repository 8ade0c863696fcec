//! Error types for rigpool
//!
//! This module defines the error types for all components of the application.
//! "Could not find" and "failed while trying" are deliberately distinguishable:
//! ordinary absence is expressed as `Option`/`None` at the public API surface,
//! while these types are reserved for actual faults.

use std::path::PathBuf;
use thiserror::Error;

/// Transport errors raised while fetching a resource from its source
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// Invalid URL provided
    #[error("Invalid URL: {url} - {error}")]
    InvalidUrl { url: String, error: String },

    /// Server returned error status
    #[error("Server error: HTTP {status} for {url}")]
    ServerError { status: u16, url: String },

    /// I/O error during file operations
    #[error("File I/O error")]
    Io(#[from] std::io::Error),

    /// Atomic file operation failed
    #[error("Atomic file operation failed: could not rename {temp_path} to {final_path}")]
    AtomicOperationFailed {
        temp_path: PathBuf,
        final_path: PathBuf,
    },

    /// No file matched a wildcard or multi-file pattern
    #[error("No files matched pattern: {pattern}")]
    NoMatches { pattern: String },

    /// Packing a directory/multi-file fetch into a single artifact failed
    #[error("Failed to pack fetched files into archive: {reason}")]
    Archive { reason: String },
}

/// Cache coordination errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Cache directory not found or inaccessible
    #[error("Cache directory not accessible: {path}")]
    DirectoryNotAccessible { path: PathBuf },

    /// Another owner's fetch did not complete within the wait budget
    #[error("Timed out after {seconds}s waiting for another fetch of {key}")]
    WaitTimeout { key: String, seconds: u64 },

    /// Cached artifact disagrees with the source's reported size
    #[error(
        "Cached artifact for {key} is stale: cached {cached_size} bytes, source reports {source_size} bytes"
    )]
    Stale {
        key: String,
        cached_size: u64,
        source_size: u64,
    },

    /// Fetch marker could not be created or removed
    #[error("Fetch marker operation failed for {key}")]
    Marker {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Linking the shared entry into the per-job namespace failed
    #[error("Failed to link cache entry into per-job namespace: {path}")]
    LinkFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Underlying transport failure while fetching
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Generic I/O error on the shared cache
    #[error("Cache I/O error")]
    Io(#[from] std::io::Error),
}

/// Lease store and allocator errors
#[derive(Error, Debug)]
pub enum LeaseError {
    /// No free/claimable slot or no sufficiently long contiguous run
    #[error("Pool {pool} exhausted: {reason}")]
    Exhausted { pool: String, reason: String },

    /// Unknown pool name
    #[error("Unknown pool: {pool}")]
    UnknownPool { pool: String },

    /// Database error
    #[error("Lease database error")]
    Database(#[from] sqlx::Error),

    /// Renewal raced away: the row no longer matches the holder
    #[error("Lease for {addr} no longer held by {mac}")]
    RenewalRaced { addr: String, mac: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    /// Invalid configuration format
    #[error("Invalid configuration format")]
    InvalidFormat(#[from] toml::de::Error),

    /// Missing required configuration field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// Malformed pool boundaries
    #[error("Invalid pool boundaries for {pool}: start {start} must not exceed end {end}")]
    InvalidPoolBounds {
        pool: String,
        start: String,
        end: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}. {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// I/O error reading or writing configuration
    #[error("Configuration I/O error")]
    Io(#[from] std::io::Error),
}

/// Top-level application error that can represent any error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Transport error
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Lease error
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Generic I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic application error with context
    #[error("Application error: {message}")]
    Generic { message: String },
}

impl AppError {
    /// Create a generic application error with a message
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable (transient)
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Fetch(FetchError::Http(_))
            | AppError::Fetch(FetchError::ServerError { .. })
            | AppError::Cache(CacheError::WaitTimeout { .. })
            | AppError::Cache(CacheError::Fetch(_))
            | AppError::Lease(LeaseError::Exhausted { .. })
            | AppError::Lease(LeaseError::RenewalRaced { .. }) => true,

            AppError::Fetch(FetchError::InvalidUrl { .. })
            | AppError::Cache(CacheError::Stale { .. })
            | AppError::Config(_) => false,

            _ => false,
        }
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Fetch(_) => "fetch",
            AppError::Cache(_) => "cache",
            AppError::Lease(_) => "lease",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Generic { .. } => "generic",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Fetch result type alias
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Cache result type alias
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Lease result type alias
pub type LeaseResult<T> = std::result::Result<T, LeaseError>;

/// Config result type alias
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
