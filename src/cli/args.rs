//! Command-line argument parsing for rigpool
//!
//! This module defines the CLI structure using clap derive macros, covering
//! artifact fetching, cache maintenance and lease-pool administration.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// rigpool - shared artifact cache and address-lease pool
#[derive(Parser, Debug)]
#[command(
    name = "rigpool",
    version,
    about = "Shared artifact cache and address-lease pool for test-rig automation",
    long_about = "Fetches named build artifacts into a shared cache with at-most-one-fetch \
coordination across concurrent jobs, and manages durable address-lease pools with \
single-holder and contiguous-reservation guarantees."
)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all subcommands
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Very verbose logging (debug level)
    #[arg(long, global = true)]
    pub very_verbose: bool,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Shared cache directory path
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch an artifact into the cache and print its local path
    Fetch(FetchArgs),

    /// Check whether an artifact is cached or fetchable
    Exists {
        /// Resource specification
        #[arg(value_name = "SPEC")]
        spec: String,
    },

    /// Remove an artifact from the shared cache
    Evict {
        /// Resource specification
        #[arg(value_name = "SPEC")]
        spec: String,
    },

    /// Cache maintenance
    Cache(CacheArgs),

    /// Lease pool administration
    Lease(LeaseArgs),
}

/// Arguments for the fetch command
#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// Resource specification (path, URL, or pattern)
    #[arg(value_name = "SPEC")]
    pub spec: String,

    /// Treat the spec as a multi-file pattern packed into one artifact
    #[arg(short, long)]
    pub multiple: bool,

    /// Refetch when the cached copy's size disagrees with the source
    #[arg(long)]
    pub replace: bool,
}

/// Arguments for cache maintenance
#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache maintenance actions
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Remove shared entries untouched for a number of days
    Cleanup {
        /// Age threshold in days (defaults to the configured value)
        #[arg(long)]
        days: Option<u64>,
    },
}

/// Arguments for lease administration
#[derive(Args, Debug)]
pub struct LeaseArgs {
    #[command(subcommand)]
    pub action: LeaseAction,
}

/// Lease administration actions
#[derive(Subcommand, Debug)]
pub enum LeaseAction {
    /// Run the reservation RPC server
    Serve {
        /// Bind address (defaults to the configured loopback address)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Reserve one free address under a label
    Reserve {
        /// Pool name
        #[arg(value_name = "POOL")]
        pool: String,

        /// Opaque reservation label
        #[arg(value_name = "LABEL")]
        label: String,

        /// Also record a MAC against the reserved address
        #[arg(long)]
        mac: Option<String>,
    },

    /// Reserve a contiguous run of addresses, all or nothing
    ReserveRange {
        /// Pool name
        #[arg(value_name = "POOL")]
        pool: String,

        /// Number of consecutive addresses
        #[arg(value_name = "COUNT")]
        count: usize,

        /// Opaque reservation label
        #[arg(value_name = "LABEL")]
        label: String,
    },

    /// Release a reservation by address
    Release {
        /// Reserved address
        #[arg(value_name = "ADDRESS")]
        address: Ipv4Addr,
    },

    /// List reserved addresses of a pool
    List {
        /// Pool name
        #[arg(value_name = "POOL")]
        pool: String,
    },

    /// Force a dynamic lease to expire, freeing its slot
    Expire {
        /// Leased address
        #[arg(value_name = "ADDRESS")]
        address: Ipv4Addr,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the logging level based on global arguments
    pub fn log_level(&self) -> tracing::Level {
        if self.global.quiet {
            tracing::Level::ERROR
        } else if self.global.very_verbose {
            tracing::Level::DEBUG
        } else if self.global.verbose {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_command_parsing() {
        let cli = Cli::try_parse_from(["rigpool", "fetch", "builds/trunk/main.iso", "--replace"])
            .unwrap();
        match cli.command {
            Commands::Fetch(args) => {
                assert_eq!(args.spec, "builds/trunk/main.iso");
                assert!(args.replace);
                assert!(!args.multiple);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_lease_reserve_range_parsing() {
        let cli = Cli::try_parse_from([
            "rigpool",
            "lease",
            "reserve-range",
            "mgmt",
            "4",
            "cluster-a",
        ])
        .unwrap();
        match cli.command {
            Commands::Lease(args) => match args.action {
                LeaseAction::ReserveRange { pool, count, label } => {
                    assert_eq!(pool, "mgmt");
                    assert_eq!(count, 4);
                    assert_eq!(label, "cluster-a");
                }
                other => panic!("unexpected action: {:?}", other),
            },
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_bad_address_rejected() {
        assert!(Cli::try_parse_from(["rigpool", "lease", "release", "not-an-ip"]).is_err());
    }

    #[test]
    fn test_log_level() {
        let quiet = Cli::try_parse_from(["rigpool", "-q", "exists", "x"]).unwrap();
        assert_eq!(quiet.log_level(), tracing::Level::ERROR);
        let verbose = Cli::try_parse_from(["rigpool", "-v", "exists", "x"]).unwrap();
        assert_eq!(verbose.log_level(), tracing::Level::INFO);
    }
}
