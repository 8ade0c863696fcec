//! rigpool CLI application
//!
//! Command-line interface for the shared artifact cache and the address-lease
//! pools.

use std::process;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use rigpool::cli::{
    handle_cache, handle_evict, handle_exists, handle_fetch, handle_lease, Cli, Commands,
};
use rigpool::errors::Result;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Main application logic
async fn run() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(&cli);

    info!("rigpool v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Fetch(args) => handle_fetch(&cli.global, args).await,
        Commands::Exists { spec } => handle_exists(&cli.global, &spec).await,
        Commands::Evict { spec } => handle_evict(&cli.global, &spec).await,
        Commands::Cache(args) => handle_cache(&cli.global, args).await,
        Commands::Lease(args) => handle_lease(&cli.global, args).await,
    }
}

/// Initialize logging based on CLI verbosity settings
fn init_logging(cli: &Cli) {
    let log_level = cli.log_level();

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("rigpool={}", log_level).parse().unwrap());

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(cli.global.very_verbose)
        .init();
}
