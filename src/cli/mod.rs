//! Command-line interface components
//!
//! This module contains CLI-specific code for rigpool, including argument
//! parsing and the command handlers.

pub mod args;
pub mod commands;

pub use args::{
    CacheAction, CacheArgs, Cli, Commands, FetchArgs, GlobalArgs, LeaseAction, LeaseArgs,
};
pub use commands::{handle_cache, handle_evict, handle_exists, handle_fetch, handle_lease};
