//! Command handlers for the rigpool CLI
//!
//! This module implements the handlers that wire CLI arguments to the core
//! application components.

use std::sync::Arc;

use tracing::info;

use crate::app::cache::{HttpJobOracle, JobOracle, NoJobs};
use crate::app::lease::{LeaseService, LeaseStore, RpcServer};
use crate::app::{FetchCoordinator, FetchOptions, HttpTransport, NameResolver};
use crate::cli::{CacheAction, CacheArgs, FetchArgs, GlobalArgs, LeaseAction, LeaseArgs};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};

/// Handle the fetch command
pub async fn handle_fetch(global: &GlobalArgs, args: FetchArgs) -> Result<()> {
    let config = AppConfig::load(global.config.clone()).await?;
    let coordinator = build_coordinator(global, &config).await?;

    let options = FetchOptions {
        multiple: args.multiple,
        replace_if_differs: args.replace,
    };
    let path = coordinator.obtain(&args.spec, options).await?;
    println!("{}", path.display());
    Ok(())
}

/// Handle the exists command
pub async fn handle_exists(global: &GlobalArgs, spec: &str) -> Result<()> {
    let config = AppConfig::load(global.config.clone()).await?;
    let coordinator = build_coordinator(global, &config).await?;

    if coordinator.resource_exists(spec).await {
        println!("{}: available", spec);
        Ok(())
    } else {
        Err(AppError::generic(format!("{}: not available", spec)))
    }
}

/// Handle the evict command
pub async fn handle_evict(global: &GlobalArgs, spec: &str) -> Result<()> {
    let config = AppConfig::load(global.config.clone()).await?;
    let coordinator = build_coordinator(global, &config).await?;
    coordinator.evict(spec).await?;
    println!("Evicted {}", spec);
    Ok(())
}

/// Handle cache maintenance commands
pub async fn handle_cache(global: &GlobalArgs, args: CacheArgs) -> Result<()> {
    let config = AppConfig::load(global.config.clone()).await?;
    let coordinator = build_coordinator(global, &config).await?;

    match args.action {
        CacheAction::Cleanup { days } => {
            let removed = coordinator.cleanup(days).await?;
            println!("Removed {} cache entries", removed);
            Ok(())
        }
    }
}

/// Handle lease administration commands
pub async fn handle_lease(global: &GlobalArgs, args: LeaseArgs) -> Result<()> {
    let config = AppConfig::load(global.config.clone()).await?;
    let service = build_lease_service(&config).await?;

    match args.action {
        LeaseAction::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.rpc.bind_addr.clone());
            let server = RpcServer::bind(Arc::new(service), Some(&bind)).await?;
            server.serve().await?;
            Ok(())
        }
        LeaseAction::Reserve { pool, label, mac } => {
            let addr = service.reserve_single(&pool, &label, mac.as_deref()).await?;
            println!("{}", addr);
            Ok(())
        }
        LeaseAction::ReserveRange { pool, count, label } => {
            let addrs = service.reserve_range(&pool, count, &label).await?;
            for addr in addrs {
                println!("{}", addr);
            }
            Ok(())
        }
        LeaseAction::Release { address } => {
            service.release(address).await?;
            println!("Released {}", address);
            Ok(())
        }
        LeaseAction::List { pool } => {
            for (addr, label) in service.list_reserved(&pool).await? {
                println!("{}\t{}", addr, label);
            }
            Ok(())
        }
        LeaseAction::Expire { address } => {
            service.expire(address).await?;
            println!("Expired {}", address);
            Ok(())
        }
    }
}

/// Assemble a fetch coordinator from loaded configuration
async fn build_coordinator(global: &GlobalArgs, config: &AppConfig) -> Result<FetchCoordinator> {
    let mut cache_config = config.cache.to_runtime_config();
    if let Some(dir) = &global.cache_dir {
        cache_config.shared_root = Some(dir.clone());
    }

    let transport = Arc::new(HttpTransport::with_config(config.client.to_runtime_config())?);
    let resolver = NameResolver::new(config.resolver.to_runtime_config());
    let jobs: Arc<dyn JobOracle> = match &config.cache.job_status_url {
        Some(url) => Arc::new(HttpJobOracle::new(reqwest::Client::new(), url.clone())),
        None => Arc::new(NoJobs),
    };
    let coordinator = FetchCoordinator::new(cache_config, resolver, transport, jobs).await?;
    Ok(coordinator)
}

/// Assemble the lease service from loaded configuration
async fn build_lease_service(config: &AppConfig) -> Result<LeaseService> {
    let store = match &config.leases.database {
        Some(path) => LeaseStore::new(path).await?,
        None => {
            info!("No lease database configured, using a non-durable in-memory store");
            LeaseStore::in_memory().await?
        }
    };
    let pools = config.to_pool_configs()?;
    LeaseService::new(store, pools).await
}
