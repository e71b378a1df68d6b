//! Redfire Clocksync - Bidirectional Feed-Forward Clock Synchronization
//!
//! Turns a stream of round-trip probe exchanges against a reference server into
//! a continuously updated, bounded-error affine mapping from raw hardware
//! counter ticks to calendar time: `Ca(T) = phat * T + C - thetahat`.
//!
//! The estimation core (`core`) is synchronous and single-writer. The async
//! boundary that feeds it stamps and publishes its parameters lives in
//! `services`.
//!
//! **Sponsored by [Carrier One Inc](https://carrierone.com) - Professional Telecommunications Solutions**

pub mod config;
pub mod core;
pub mod services;
pub mod testing;
pub mod error;
pub mod utils;

pub use error::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
