//! rigpool library
//!
//! A shared artifact cache and address-lease pool for test-rig automation.
//! Provides at-most-one-fetch caching of named artifacts on a shared
//! filesystem and single-holder address leasing with contiguous-range
//! reservations, both safe under multi-process concurrency.

pub mod app;
pub mod cli;
pub mod config;
pub mod constants;
pub mod errors;

// Re-export commonly used types for convenience
pub use errors::{AppError, Result};
