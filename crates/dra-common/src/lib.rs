//! DRA Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ambient concerns shared by the DeFi revenue-attribution pipeline crates.
//! At the moment that is the `tracing` subscriber setup used by every
//! binary in the workspace.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
