//! proxyrig - ephemeral multi-process test environments for a reverse proxy
//!
//! This library provisions a small topology of proxy instances and runs
//! suites against it:
//! - Probes the host for kernel TLS offload and fixes the feature set once
//! - Finds or builds the proxy binary for that feature set
//! - Writes certificates, static content and one config per instance
//! - Spawns backends, then the proxy, and checks their liveness
//! - Runs an external benchmark or test command against the live topology
//! - Tears every instance down with SIGTERM, then SIGKILL, on every exit path

pub mod builder;
pub mod capability;
pub mod cli;
pub mod config;
pub mod error;
pub mod fixtures;
pub mod healthcheck;
pub mod modes;
pub mod process;
pub mod registry;
pub mod render;
pub mod runner;
pub mod topology;

pub use error::{HarnessError, Result};

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
