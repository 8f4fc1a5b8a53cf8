use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an alternative configuration file
pub const CONFIG_ENV_VAR: &str = "PROXYRIG_CONFIG";

/// Configuration file picked up from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "proxyrig.toml";

/// Global configuration for the harness
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HarnessConfig {
    /// Where the proxy project lives and how to build it
    #[serde(default)]
    pub project: ProjectConfig,

    /// Instances to provision
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Delays, timeouts and shutdown escalation
    #[serde(default)]
    pub timing: TimingConfig,

    /// External benchmark/test runner commands
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Settings written into generated instance configs
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    /// Root of the proxy project (build commands run here)
    #[serde(default = "default_project_root")]
    pub root: PathBuf,

    /// Name of the proxy binary
    #[serde(default = "default_binary_name")]
    pub binary: String,

    /// Explicit artifact locations; when empty the release output of the
    /// project and of its parent workspace are checked
    #[serde(default)]
    pub candidates: Vec<PathBuf>,

    /// Build command template, `{features}` is substituted
    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Fixture workspace, relative paths resolve against `root`
    #[serde(default = "default_workspace_dir")]
    pub workspace: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: default_project_root(),
            binary: default_binary_name(),
            candidates: Vec::new(),
            build_command: default_build_command(),
            workspace: default_workspace_dir(),
        }
    }
}

impl ProjectConfig {
    /// Absolute-or-root-relative fixture workspace path
    pub fn workspace_dir(&self) -> PathBuf {
        if self.workspace.is_absolute() {
            self.workspace.clone()
        } else {
            self.root.join(&self.workspace)
        }
    }
}

/// A backend entry in the topology section
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackendEntry {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TopologyConfig {
    /// Address every instance binds to
    #[serde(default = "default_bind_host")]
    pub host: String,

    /// Backend instances, spawned in this order
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendEntry>,

    /// Name of the proxying instance
    #[serde(default = "default_proxy_name")]
    pub proxy_name: String,

    /// Secure listener of the proxy
    #[serde(default = "default_proxy_https_port")]
    pub proxy_https_port: u16,

    /// Plain-text companion listener of the proxy (health and metrics)
    #[serde(default = "default_proxy_http_port")]
    pub proxy_http_port: u16,

    /// Host headers the generated routes match on
    #[serde(default = "default_route_hosts")]
    pub route_hosts: Vec<String>,

    /// Name of the upstream group listing every backend
    #[serde(default = "default_upstream_name")]
    pub upstream: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            backends: default_backends(),
            proxy_name: default_proxy_name(),
            proxy_https_port: default_proxy_https_port(),
            proxy_http_port: default_proxy_http_port(),
            route_hosts: default_route_hosts(),
            upstream: default_upstream_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Pause between spawning the last backend and the proxy
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Pause between spawning the proxy and the first health check
    #[serde(default = "default_startup_wait")]
    pub startup_wait_ms: u64,

    /// Per-request timeout for liveness probes
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,

    /// Interval between liveness polls after SIGTERM
    #[serde(default = "default_shutdown_poll_interval")]
    pub shutdown_poll_interval_ms: u64,

    /// Number of polls before escalating to SIGKILL
    #[serde(default = "default_shutdown_max_polls")]
    pub shutdown_max_polls: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            startup_wait_ms: default_startup_wait(),
            health_timeout_ms: default_health_timeout(),
            shutdown_poll_interval_ms: default_shutdown_poll_interval(),
            shutdown_max_polls: default_shutdown_max_polls(),
        }
    }
}

impl TimingConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn startup_wait(&self) -> Duration {
        Duration::from_millis(self.startup_wait_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Benchmark command template, `{target}` and `{features}` are substituted
    #[serde(default = "default_bench_command")]
    pub bench_command: String,

    /// Test suite command template, `{features}` is substituted
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Working directory for runner commands (defaults to the project root)
    pub working_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            bench_command: default_bench_command(),
            test_command: default_test_command(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Log level written into every instance config
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Metrics endpoint of the proxying instance
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Liveness endpoint of backend instances
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Environment handed to the proxying instance only
    #[serde(default = "default_proxy_env")]
    pub env: BTreeMap<String, String>,

    /// Kill leftover instances by name and workspace path after teardown
    #[serde(default = "default_sweep")]
    pub sweep: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_path: default_metrics_path(),
            health_path: default_health_path(),
            env: default_proxy_env(),
            sweep: default_sweep(),
        }
    }
}

// Default value functions
fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_binary_name() -> String {
    "veil".to_string()
}

fn default_build_command() -> String {
    "cargo build --release --features {features}".to_string()
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("tests/e2e_fixtures")
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backends() -> Vec<BackendEntry> {
    vec![
        BackendEntry {
            name: "backend1".to_string(),
            port: 9001,
        },
        BackendEntry {
            name: "backend2".to_string(),
            port: 9002,
        },
    ]
}

fn default_proxy_name() -> String {
    "proxy".to_string()
}

fn default_proxy_https_port() -> u16 {
    8443
}

fn default_proxy_http_port() -> u16 {
    8080
}

fn default_route_hosts() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}

fn default_upstream_name() -> String {
    "backend-pool".to_string()
}

fn default_settle_delay() -> u64 {
    1000
}

fn default_startup_wait() -> u64 {
    2000
}

fn default_health_timeout() -> u64 {
    2000
}

fn default_shutdown_poll_interval() -> u64 {
    1000
}

fn default_shutdown_max_polls() -> u32 {
    5
}

fn default_bench_command() -> String {
    "cargo bench --bench {target} --features {features}".to_string()
}

fn default_test_command() -> String {
    "cargo test --test integration_tests --features {features}".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_path() -> String {
    "/__metrics".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_proxy_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("VEIL_UPSTREAM_TLS_INSECURE".to_string(), "1".to_string());
    env
}

fn default_sweep() -> bool {
    true
}

impl HarnessConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HarnessConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `PROXYRIG_CONFIG`, then `./proxyrig.toml`, else defaults
    pub fn discover() -> anyhow::Result<(Self, Option<PathBuf>)> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from) {
            let config = Self::load(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?;
            return Ok((config, Some(path)));
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            let config = Self::load(&local)?;
            return Ok((config, Some(local)));
        }

        Ok((Self::default(), None))
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.project.binary.trim().is_empty() {
            errors.push("project.binary must not be empty".to_string());
        }
        if !self.project.build_command.contains("{features}") {
            errors.push("project.build_command must contain '{features}'".to_string());
        }
        if self.topology.backends.is_empty() {
            errors.push("topology.backends must list at least one backend".to_string());
        }
        for backend in &self.topology.backends {
            if backend.port == 0 {
                errors.push(format!("Backend '{}': 'port' must be greater than 0", backend.name));
            }
        }
        if self.topology.proxy_https_port == 0 || self.topology.proxy_http_port == 0 {
            errors.push("topology proxy ports must be greater than 0".to_string());
        }
        if self.timing.shutdown_max_polls == 0 {
            errors.push("timing.shutdown_max_polls must be at least 1".to_string());
        }
        if !self.proxy.metrics_path.starts_with('/') || !self.proxy.health_path.starts_with('/') {
            errors.push("metrics_path and health_path must start with '/'".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
