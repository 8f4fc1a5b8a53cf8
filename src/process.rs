use crate::error::{HarnessError, Result};
use crate::registry::PidRegistry;
use crate::render::GeneratedConfigs;
use crate::topology::{Instance, Topology};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Bounded wait between the graceful and the forced termination phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_polls: 5,
        }
    }
}

/// Signature of leftover instances: launched as `binary_name` with an
/// argument inside `workspace`.
///
/// Only an absolute workspace matches anything, and arguments are compared
/// by path components, so `/work/e2e` never matches `/work/e2e2/...`.
#[derive(Debug, Clone)]
pub struct SweepPattern {
    pub binary_name: String,
    pub workspace: PathBuf,
}

impl SweepPattern {
    pub fn new(binary_name: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            binary_name: binary_name.into(),
            workspace: workspace.into(),
        }
    }

    pub fn matches(&self, cmdline: &[String]) -> bool {
        let Some((argv0, args)) = cmdline.split_first() else {
            return false;
        };
        let name_matches = Path::new(argv0)
            .file_name()
            .map(|n| n == self.binary_name.as_str())
            .unwrap_or(false);
        if !name_matches || !self.workspace.is_absolute() {
            return false;
        }
        args.iter()
            .any(|a| Path::new(a).starts_with(&self.workspace))
    }
}

/// An instance process started by this supervisor
#[derive(Debug)]
pub struct ManagedProcess {
    pub pid: u32,
    pub instance: String,
    child: Child,
}

/// Outcome of [`ProcessSupervisor::terminate_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Pids that received SIGTERM
    pub signalled: Vec<u32>,
    /// Pids still alive after the grace polls, killed with SIGKILL
    pub forced: Vec<u32>,
    /// Pids that were already gone before the first signal
    pub already_exited: Vec<u32>,
    /// Pids killed by the post-registry sweep
    pub swept: Vec<u32>,
}

impl TerminationReport {
    pub fn is_empty(&self) -> bool {
        self.signalled.is_empty()
            && self.forced.is_empty()
            && self.already_exited.is_empty()
            && self.swept.is_empty()
    }
}

/// Starts instances and guarantees their termination.
///
/// Children are tracked in memory for this invocation and every pid is
/// also journaled to the [`PidRegistry`], so `stop` from another process
/// tree can find them.
pub struct ProcessSupervisor {
    registry: PidRegistry,
    logs_dir: PathBuf,
    proxy_env: BTreeMap<String, String>,
    policy: ShutdownPolicy,
    sweep: Option<SweepPattern>,
    processes: Vec<ManagedProcess>,
}

impl ProcessSupervisor {
    pub fn new(registry: PidRegistry, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            logs_dir: logs_dir.into(),
            proxy_env: BTreeMap::new(),
            policy: ShutdownPolicy::default(),
            sweep: None,
            processes: Vec::new(),
        }
    }

    /// Environment added to the proxying instance only
    pub fn with_proxy_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.proxy_env = env;
        self
    }

    pub fn with_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable the post-registry sweep
    pub fn with_sweep(mut self, pattern: SweepPattern) -> Self {
        self.sweep = Some(pattern);
        self
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    pub fn pid_of(&self, instance: &str) -> Option<u32> {
        self.processes
            .iter()
            .find(|p| p.instance == instance)
            .map(|p| p.pid)
    }

    /// Start `binary -c <config>` for one instance.
    ///
    /// The child gets its own process group and a null stdin, and its
    /// output is appended to `logs/<instance>.log`. The pid is journaled
    /// before this returns.
    pub async fn spawn(
        &mut self,
        binary: &Path,
        instance: &Instance,
        config_path: &Path,
    ) -> Result<u32> {
        let spawn_err = |source: std::io::Error| HarnessError::Spawn {
            instance: instance.name.clone(),
            source,
        };

        std::fs::create_dir_all(&self.logs_dir).map_err(spawn_err)?;
        let log_path = self.logs_dir.join(format!("{}.log", instance.name));
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(spawn_err)?;
        let stderr = stdout.try_clone().map_err(spawn_err)?;

        info!(
            instance = %instance.name,
            binary = %binary.display(),
            config = %config_path.display(),
            "Starting instance"
        );

        let mut cmd = Command::new(binary);
        cmd.arg("-c").arg(config_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));

        // Detach from our process group so a terminal ^C reaches only us;
        // teardown decides what happens to the instances
        #[cfg(unix)]
        cmd.process_group(0);

        if instance.is_proxy() {
            for (key, value) in &self.proxy_env {
                cmd.env(key, value);
            }
        }

        let mut child = cmd.spawn().map_err(spawn_err)?;
        let Some(pid) = child.id() else {
            return Err(spawn_err(std::io::Error::other(
                "process exited before its pid was known",
            )));
        };

        if let Err(e) = self.registry.append(pid) {
            // An unrecorded instance could outlive us, so do not keep it
            let _ = child.start_kill();
            return Err(spawn_err(e));
        }

        info!(instance = %instance.name, pid, log = %log_path.display(), "Instance spawned");
        self.processes.push(ManagedProcess {
            pid,
            instance: instance.name.clone(),
            child,
        });
        Ok(pid)
    }

    /// Spawn every backend in order, wait `settle_delay`, then the proxy
    pub async fn spawn_topology(
        &mut self,
        binary: &Path,
        topology: &Topology,
        configs: &GeneratedConfigs,
        settle_delay: Duration,
    ) -> Result<()> {
        let config_for = |instance: &Instance| -> Result<PathBuf> {
            configs
                .path_for(&instance.name)
                .map(Path::to_path_buf)
                .ok_or_else(|| {
                    HarnessError::Config(format!("no config generated for '{}'", instance.name))
                })
        };

        for backend in topology.backends() {
            let config = config_for(backend)?;
            self.spawn(binary, backend, &config).await?;
        }

        debug!(delay_ms = settle_delay.as_millis() as u64, "Waiting for backends to settle");
        tokio::time::sleep(settle_delay).await;

        let proxy = topology.proxy();
        let config = config_for(proxy)?;
        self.spawn(binary, proxy, &config).await?;
        Ok(())
    }

    /// Terminate every known instance.
    ///
    /// Covers the in-memory children and every pid in the registry. Sends
    /// SIGTERM, polls until all are gone or the policy runs out, then
    /// SIGKILLs survivors. The registry is deleted afterwards and the sweep
    /// runs if enabled. Never fails; calling it twice is harmless.
    pub async fn terminate_all(&mut self) -> TerminationReport {
        let mut report = TerminationReport::default();

        let mut pids = match self.registry.read() {
            Ok(pids) => pids,
            Err(e) => {
                warn!(
                    registry = %self.registry.path().display(),
                    error = %e,
                    "Could not read pid registry"
                );
                Vec::new()
            }
        };
        if pids.is_empty() && !self.registry.exists() && self.processes.is_empty() {
            info!(
                registry = %self.registry.path().display(),
                "No pid registry found, nothing to stop"
            );
        }
        for process in &self.processes {
            if !pids.contains(&process.pid) {
                pids.push(process.pid);
            }
        }

        // Phase 1: graceful
        for &pid in &pids {
            if self.is_alive(pid) {
                info!(pid, instance = self.instance_name(pid), "Sending SIGTERM");
                send_signal(pid, Signal::Terminate);
                report.signalled.push(pid);
            } else {
                debug!(pid, "Already exited");
                report.already_exited.push(pid);
            }
        }

        // Phase 2: bounded wait, awaited collectively
        let mut polls = 0;
        let mut survivors = self.alive_of(&report.signalled);
        while !survivors.is_empty() && polls < self.policy.max_polls {
            tokio::time::sleep(self.policy.poll_interval).await;
            polls += 1;
            survivors = self.alive_of(&survivors);
        }

        // Phase 3: forced
        for pid in survivors {
            warn!(
                pid,
                instance = self.instance_name(pid),
                waited_ms = (self.policy.poll_interval * polls).as_millis() as u64,
                "Termination timeout, sending SIGKILL"
            );
            send_signal(pid, Signal::Kill);
            report.forced.push(pid);
        }

        self.reap().await;

        if let Err(e) = self.registry.clear() {
            warn!(registry = %self.registry.path().display(), error = %e, "Could not remove pid registry");
        }

        if let Some(pattern) = &self.sweep {
            for pid in find_matching(pattern) {
                warn!(pid, binary = %pattern.binary_name, "Sweeping leftover instance");
                send_signal(pid, Signal::Kill);
                report.swept.push(pid);
            }
        }

        info!(
            signalled = report.signalled.len(),
            forced = report.forced.len(),
            already_exited = report.already_exited.len(),
            swept = report.swept.len(),
            "Teardown complete"
        );
        report
    }

    fn instance_name(&self, pid: u32) -> &str {
        self.processes
            .iter()
            .find(|p| p.pid == pid)
            .map(|p| p.instance.as_str())
            .unwrap_or("unknown")
    }

    fn alive_of(&mut self, pids: &[u32]) -> Vec<u32> {
        pids.iter().copied().filter(|&pid| self.is_alive(pid)).collect()
    }

    /// Own children are asked directly (this also reaps them); anything
    /// else is looked up in the process table
    fn is_alive(&mut self, pid: u32) -> bool {
        if let Some(process) = self.processes.iter_mut().find(|p| p.pid == pid) {
            match process.child.try_wait() {
                Ok(Some(_)) => return false,
                Ok(None) => return true,
                Err(e) => debug!(pid, error = %e, "try_wait failed, checking process table"),
            }
        }
        pid_alive(pid)
    }

    /// Collect exit statuses of killed children so no zombies linger
    async fn reap(&mut self) {
        for mut process in self.processes.drain(..) {
            match tokio::time::timeout(Duration::from_secs(1), process.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(pid = process.pid, instance = %process.instance, ?status, "Instance exited")
                }
                Ok(Err(e)) => {
                    debug!(pid = process.pid, error = %e, "Error waiting for instance")
                }
                Err(_) => warn!(pid = process.pid, "Instance did not exit after SIGKILL"),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Terminate,
    Kill,
}

/// Signal the instance's process group, falling back to the pid alone
#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // 0 and 1 would address our own group or every process
    let pid = match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 1 => pid,
        _ => return,
    };
    // SAFETY: kill(2) takes no pointers
    unsafe {
        if libc::kill(-pid, sig) != 0 {
            libc::kill(pid, sig);
        }
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) {
    warn!(pid, ?signal, "Signals are not supported on this platform");
}

/// SIGKILL every recorded pid and drop the registry.
///
/// Synchronous so it can run from `Drop` while a run unwinds.
pub fn force_kill_recorded(registry: &PidRegistry) {
    let pids = registry.read().unwrap_or_default();
    for pid in pids {
        if pid_alive(pid) {
            warn!(pid, "Force-killing instance left behind");
            send_signal(pid, Signal::Kill);
        }
    }
    let _ = registry.clear();
}

/// Whether `pid` names a live process; zombies count as exited
#[cfg(target_os = "linux")]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match procfs::process::Process::new(pid).and_then(|p| p.stat()) {
        Ok(stat) => !matches!(stat.state, 'Z' | 'X' | 'x'),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Live processes matching `pattern`, excluding this one
#[cfg(target_os = "linux")]
pub fn find_matching(pattern: &SweepPattern) -> Vec<u32> {
    let own = std::process::id();
    let processes = match procfs::process::all_processes() {
        Ok(processes) => processes,
        Err(e) => {
            warn!(error = %e, "Could not list processes for sweep");
            return Vec::new();
        }
    };

    processes
        .filter_map(|p| p.ok())
        .filter_map(|p| {
            let pid = u32::try_from(p.pid()).ok()?;
            if pid == own {
                return None;
            }
            let cmdline = p.cmdline().ok()?;
            (pattern.matches(&cmdline) && pid_alive(pid)).then_some(pid)
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub fn find_matching(pattern: &SweepPattern) -> Vec<u32> {
    debug!(binary = %pattern.binary_name, "Process sweep unavailable on this platform");
    Vec::new()
}
