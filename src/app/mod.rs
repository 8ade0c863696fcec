//! Core application logic for rigpool
//!
//! This module contains the main application components: the HTTP transport,
//! the name resolver, the shared artifact cache with its fetch coordinator,
//! and the address-lease subsystem.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rigpool::app::{FetchCoordinator, HttpTransport, NameResolver, NoJobs};
//! use rigpool::app::cache::CacheConfig;
//! use rigpool::app::resolver::ResolverConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(HttpTransport::new()?);
//! let resolver = NameResolver::new(ResolverConfig::default());
//! let coordinator = FetchCoordinator::new(
//!     CacheConfig::default(),
//!     resolver,
//!     transport,
//!     Arc::new(NoJobs),
//! )
//! .await?;
//!
//! if let Some(path) = coordinator.get_resource("builds/trunk/main.iso").await {
//!     println!("artifact at {}", path.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod client;
pub mod lease;
pub mod resolver;

// Re-export main public API
pub use cache::{
    CacheConfig, CacheKey, CacheStore, CacheTier, FetchCoordinator, FetchOptions, HttpJobOracle,
    JobOracle, NoJobs,
};
pub use client::{ClientConfig, HttpTransport, Transport};
pub use lease::{LeaseAssignment, LeaseService, LeaseStore, PoolConfig};
pub use resolver::{FetchShape, NameResolver, ResolvedName, ResolverConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        // Ensure public API is accessible
        let options = FetchOptions::default();
        assert!(!options.multiple);
    }
}
