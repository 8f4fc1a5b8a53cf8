//! External benchmark and test suite invocation

use crate::capability::FeatureSet;
use crate::config::RunnerConfig;
use crate::error::{HarnessError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;
use tracing::{info, warn};

/// Exit code reported when the runner was killed by a signal
const SIGNALLED_EXIT_CODE: i32 = 1;

/// Named benchmark suites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchTarget {
    Http2,
    Http3,
    Tls,
    Compression,
    Cache,
    ConnectionPool,
    LoadBalancing,
    Memory,
    Routing,
    Websocket,
}

impl BenchTarget {
    /// Every target, in the order `all` runs them
    pub const ALL: [BenchTarget; 10] = [
        BenchTarget::Http2,
        BenchTarget::Http3,
        BenchTarget::Tls,
        BenchTarget::Compression,
        BenchTarget::Cache,
        BenchTarget::ConnectionPool,
        BenchTarget::LoadBalancing,
        BenchTarget::Memory,
        BenchTarget::Routing,
        BenchTarget::Websocket,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BenchTarget::Http2 => "http2",
            BenchTarget::Http3 => "http3",
            BenchTarget::Tls => "tls",
            BenchTarget::Compression => "compression",
            BenchTarget::Cache => "cache",
            BenchTarget::ConnectionPool => "connection_pool",
            BenchTarget::LoadBalancing => "load_balancing",
            BenchTarget::Memory => "memory",
            BenchTarget::Routing => "routing",
            BenchTarget::Websocket => "websocket",
        }
    }

    /// Runs over QUIC only
    pub fn is_http3_only(&self) -> bool {
        matches!(self, BenchTarget::Http3)
    }
}

impl fmt::Display for BenchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BenchTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BenchTarget::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| format!("unknown benchmark target '{}'", s))
    }
}

/// What the runner executes against the live topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suite {
    Bench(BenchTarget),
    Tests,
}

impl Suite {
    /// Features for this execution, derived from the build's feature set
    pub fn features(&self, build: &FeatureSet) -> FeatureSet {
        match self {
            Suite::Bench(target) => build.for_target(target.is_http3_only()),
            Suite::Tests => build.clone(),
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suite::Bench(target) => write!(f, "bench {}", target),
            Suite::Tests => f.write_str("tests"),
        }
    }
}

/// Substitute `{key}` placeholders and split the result shell-style
pub fn render_command(
    template: &str,
    substitutions: &[(&str, &str)],
) -> std::result::Result<Vec<String>, String> {
    let mut rendered = template.to_string();
    for (key, value) in substitutions {
        rendered = rendered.replace(&format!("{{{}}}", key), value);
    }
    let argv = shell_words::split(&rendered)
        .map_err(|e| format!("invalid command '{}': {}", rendered, e))?;
    if argv.is_empty() {
        return Err("command is empty".to_string());
    }
    Ok(argv)
}

#[derive(Debug, Clone)]
pub struct Runner {
    bench_command: String,
    test_command: String,
    working_dir: PathBuf,
}

impl Runner {
    pub fn new(config: &RunnerConfig, project_root: &Path) -> Self {
        Self {
            bench_command: config.bench_command.clone(),
            test_command: config.test_command.clone(),
            working_dir: config
                .working_dir
                .clone()
                .unwrap_or_else(|| project_root.to_path_buf()),
        }
    }

    /// Command line for `suite` with the given features
    pub fn command_line(&self, suite: Suite, features: &FeatureSet) -> Result<Vec<String>> {
        let features = features.cargo_list();
        let argv = match suite {
            Suite::Bench(target) => render_command(
                &self.bench_command,
                &[("target", target.name()), ("features", features.as_str())],
            ),
            Suite::Tests => render_command(&self.test_command, &[("features", features.as_str())]),
        };
        argv.map_err(HarnessError::Runner)
    }

    /// Run `suite` to completion and return its exit code.
    ///
    /// Output goes straight to our terminal. A non-zero code is a result,
    /// not an error; only failing to launch the command is.
    pub async fn run(&self, suite: Suite, build_features: &FeatureSet) -> Result<i32> {
        let features = suite.features(build_features);
        let argv = self.command_line(suite, &features)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HarnessError::Runner("command is empty".to_string()))?;

        info!(suite = %suite, features = %features, command = %argv.join(" "), "Running suite");

        let status = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| HarnessError::Runner(format!("failed to run '{}': {}", program, e)))?;

        let code = status.code().unwrap_or_else(|| {
            warn!(suite = %suite, "Runner terminated by signal");
            SIGNALLED_EXIT_CODE
        });
        if code == 0 {
            info!(suite = %suite, "Suite passed");
        } else {
            warn!(suite = %suite, exit_code = code, "Suite failed");
        }
        Ok(code)
    }
}
