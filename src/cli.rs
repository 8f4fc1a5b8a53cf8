//! Shared plumbing for the `proxyrig` and `proxyrig-bench` binaries

use crate::capability::host_probe;
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::modes::Harness;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_DIRECTIVE: &str = "proxyrig=info";

/// Exit code for a missing or unknown argument
pub const USAGE_EXIT_CODE: u8 = 2;

/// Leveled, coloured diagnostics on stderr
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration, validate the topology and probe the host
pub fn load_harness() -> anyhow::Result<Harness> {
    let (config, path) = HarnessConfig::discover()?;
    match path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => debug!("No configuration file, using defaults"),
    }

    let probe = host_probe();
    Ok(Harness::new(config, probe.as_ref())?)
}

/// Process exit code for a finished run, logging the failing phase
pub fn finish(result: anyhow::Result<i32>) -> ExitCode {
    match result {
        Ok(code) => exit_code(code),
        Err(e) => {
            error!(phase = failed_phase(&e), error = %format!("{:#}", e), "Run failed");
            ExitCode::FAILURE
        }
    }
}

/// Phase name for diagnostics; errors raised before the harness exists are
/// configuration problems
pub fn failed_phase(error: &anyhow::Error) -> &'static str {
    error
        .downcast_ref::<HarnessError>()
        .map(HarnessError::phase)
        .unwrap_or("config")
}

/// Pass a child's exit code through; out-of-range codes become 1
pub fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(exit_status(code))
}

fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
