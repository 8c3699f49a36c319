//! Castwave Core Library
//!
//! Shared functionality for castwave components:
//! - Server configuration and reload handling
//! - In-process statistics table
//! - Common error types
//! - Tracing/logging initialisation

pub mod config;
pub mod error;
pub mod stats;
pub mod tracing_init;

pub use config::{Config, ConfigStore};
pub use error::{Error, Result};
pub use stats::Stats;
pub use tracing_init::init_tracing;

/// Server identification string, sent as `User-Agent` on upstream fetches.
pub const SERVER_VERSION: &str = concat!("castwave/", env!("CARGO_PKG_VERSION"));
