//! Shared artifact cache with cross-process fetch coordination
//!
//! This module implements a shared-filesystem cache where many concurrent
//! callers (threads and independent processes, possibly on different hosts)
//! request artifacts by logical name with at-most-one-fetch semantics.
//!
//! # Key Features
//!
//! - **Hashed key layout**: one subdirectory per canonical resource name
//! - **Fetch markers**: exclusive-create `.fetching` sentinel files provide
//!   cross-process mutual exclusion without shared memory
//! - **Atomic publication**: temp-file + rename, so readers never observe a
//!   partially written artifact
//! - **Per-job links**: callers receive a hard link (or symlink for the
//!   overflow tier) isolating their lifecycle from the shared entry
//! - **Two-tier storage**: large artifacts are routed to an overflow root
//!   selected before fetch by a HEAD content-length probe
//!
//! # Module Organization
//!
//! - [`config`] - Configuration types and defaults
//! - [`store`] - Durable key-value layout, markers and atomic publish
//! - [`jobs`] - Job-status oracle used to detect stale markers
//! - [`coordinator`] - The at-most-one-fetch protocol and public cache API

pub mod config;
pub mod coordinator;
pub mod jobs;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::CacheConfig;
pub use coordinator::{FetchCoordinator, FetchOptions};
pub use jobs::{HttpJobOracle, JobOracle, NoJobs};
pub use store::{CacheKey, CacheStore, CacheTier};
