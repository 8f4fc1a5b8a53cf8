//! Run modes sequencing the environment lifecycle
//!
//! ```text
//! Idle -> Provisioning -> Running -> (Testing) -> TearingDown -> Idle
//!              |              |           |
//!              +--------------+-----------+--> TearingDown (failure or signal)
//! ```
//!
//! Every mode that starts processes arms a [`TeardownGuard`], so a run that
//! unwinds before reaching `TearingDown` still kills what it spawned.

use crate::builder::ArtifactBuilder;
use crate::capability::{CapabilityProbe, FeatureSet};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::fixtures::{absolute_path, FixtureWorkspace};
use crate::healthcheck::{HealthCheckConfig, HealthChecker};
use crate::process::{
    force_kill_recorded, ProcessSupervisor, ShutdownPolicy, SweepPattern, TerminationReport,
};
use crate::registry::PidRegistry;
use crate::render;
use crate::runner::{Runner, Suite};
use crate::topology::Topology;
use std::fmt;
use tracing::{debug, info, warn};

/// Exit code of a run cut short by SIGINT or SIGTERM
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Provisioning,
    Running,
    Testing,
    TearingDown,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Provisioning)
                | (Idle, TearingDown)
                | (Provisioning, Running)
                | (Running, Testing)
                | (Provisioning | Running | Testing, TearingDown)
                | (TearingDown, Idle)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Provisioning => "provisioning",
            RunState::Running => "running",
            RunState::Testing => "testing",
            RunState::TearingDown => "tearing-down",
        };
        f.write_str(name)
    }
}

/// Force-kills every registry pid on drop unless disarmed
pub struct TeardownGuard {
    registry: PidRegistry,
    armed: bool,
}

impl TeardownGuard {
    pub fn new(registry: PidRegistry) -> Self {
        Self {
            registry,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("Run ended without teardown, force-killing recorded instances");
            force_kill_recorded(&self.registry);
        }
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c() => info!("Received SIGINT (Ctrl+C), tearing down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, tearing down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), tearing down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
        info!("Received Ctrl+C, tearing down...");
    }
}

/// Ctrl+C, or never if the handler cannot be installed
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

enum Provisioned {
    Ready,
    Failed(HarnessError),
    Interrupted,
}

/// The environment for one invocation
pub struct Harness {
    config: HarnessConfig,
    topology: Topology,
    workspace: FixtureWorkspace,
    features: FeatureSet,
    state: RunState,
}

impl Harness {
    /// Validate the topology and probe host capabilities once
    pub fn new(config: HarnessConfig, probe: &dyn CapabilityProbe) -> Result<Self> {
        let topology = Topology::from_config(&config.topology)?;
        let workspace = FixtureWorkspace::new(absolute_path(&config.project.workspace_dir())?);
        let features = probe.probe();
        Ok(Self {
            config,
            topology,
            workspace,
            features,
            state: RunState::Idle,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn workspace(&self) -> &FixtureWorkspace {
        &self.workspace
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    fn registry(&self) -> PidRegistry {
        PidRegistry::new(self.workspace.registry_path())
    }

    fn supervisor(&self) -> ProcessSupervisor {
        let timing = &self.config.timing;
        let mut supervisor = ProcessSupervisor::new(self.registry(), self.workspace.logs_dir())
            .with_proxy_env(self.config.proxy.env.clone())
            .with_policy(ShutdownPolicy {
                poll_interval: timing.shutdown_poll_interval(),
                max_polls: timing.shutdown_max_polls,
            });
        if self.config.proxy.sweep {
            supervisor = supervisor.with_sweep(SweepPattern::new(
                &self.config.project.binary,
                self.workspace.root(),
            ));
        }
        supervisor
    }

    fn health_checker(&self) -> Result<HealthChecker> {
        HealthChecker::new(HealthCheckConfig {
            timeout: self.config.timing.health_timeout(),
            health_path: self.config.proxy.health_path.clone(),
            metrics_path: self.config.proxy.metrics_path.clone(),
        })
    }

    /// Build, write fixtures, spawn and check health once
    async fn provision(&mut self, supervisor: &mut ProcessSupervisor) -> Result<()> {
        self.transition(RunState::Provisioning);

        let binary = ArtifactBuilder::from_config(&self.config.project)
            .ensure(&self.features)
            .await?;
        let tls = self.workspace.prepare()?;
        let configs = render::generate(
            &self.workspace,
            &self.topology,
            &tls,
            &self.features,
            &self.config.proxy,
        )?;
        let checker = self.health_checker()?;

        supervisor
            .spawn_topology(
                &binary,
                &self.topology,
                &configs,
                self.config.timing.settle_delay(),
            )
            .await?;

        let wait = self.config.timing.startup_wait();
        debug!(wait_ms = wait.as_millis() as u64, "Waiting for instances to start");
        tokio::time::sleep(wait).await;

        self.transition(RunState::Running);
        checker.check(&self.topology).await.into_result()
    }

    async fn teardown(&mut self, supervisor: &mut ProcessSupervisor) -> TerminationReport {
        self.transition(RunState::TearingDown);
        let report = supervisor.terminate_all().await;
        self.transition(RunState::Idle);
        report
    }

    /// Abort after a pre-spawn failure; nothing to terminate
    fn abandon(&mut self) {
        self.transition(RunState::TearingDown);
        self.transition(RunState::Idle);
    }

    /// Provision under signal supervision, tearing down on failure
    async fn provision_guarded(&mut self, supervisor: &mut ProcessSupervisor) -> Provisioned {
        let outcome = tokio::select! {
            result = self.provision(supervisor) => Some(result),
            _ = shutdown_signal() => None,
        };

        match outcome {
            Some(Ok(())) => Provisioned::Ready,
            Some(Err(e)) => {
                if e.is_pre_spawn() && supervisor.processes().is_empty() {
                    self.abandon();
                } else {
                    self.teardown(supervisor).await;
                }
                Provisioned::Failed(e)
            }
            None => {
                self.teardown(supervisor).await;
                Provisioned::Interrupted
            }
        }
    }

    /// Provision and leave the instances running for a later `stop`
    pub async fn start(&mut self) -> Result<i32> {
        let mut guard = TeardownGuard::new(self.registry());
        let mut supervisor = self.supervisor();

        let provisioned = self.provision_guarded(&mut supervisor).await;
        guard.disarm();

        match provisioned {
            Provisioned::Ready => {
                let proxy = self.topology.proxy();
                info!(
                    proxy = %proxy.listen,
                    metrics = ?proxy.plain_listen,
                    registry = %self.workspace.registry_path().display(),
                    "Environment ready"
                );
                Ok(0)
            }
            Provisioned::Failed(e) => Err(e),
            Provisioned::Interrupted => Ok(INTERRUPTED_EXIT_CODE),
        }
    }

    /// Terminate every recorded instance; a missing registry is fine
    pub async fn stop(&mut self) -> Result<i32> {
        let mut supervisor = self.supervisor();
        self.teardown(&mut supervisor).await;
        Ok(0)
    }

    pub async fn restart(&mut self) -> Result<i32> {
        self.stop().await?;
        self.start().await
    }

    /// Check the running topology once
    pub async fn health(&self) -> Result<i32> {
        self.health_checker()?
            .check(&self.topology)
            .await
            .into_result()?;
        Ok(0)
    }

    /// Stop, then remove everything but certificates
    pub async fn clean(&mut self) -> Result<i32> {
        self.stop().await?;
        self.workspace.clean()?;
        Ok(0)
    }

    /// Provision, run `suite`, tear down; the suite's exit code wins
    pub async fn run_suite(&mut self, suite: Suite) -> Result<i32> {
        self.run_suites(&[suite]).await
    }

    /// Provision once and run every suite in order.
    ///
    /// Later suites still run after a failure; the first non-zero exit code
    /// is reported. Teardown always happens.
    pub async fn run_suites(&mut self, suites: &[Suite]) -> Result<i32> {
        let mut guard = TeardownGuard::new(self.registry());
        let mut supervisor = self.supervisor();

        match self.provision_guarded(&mut supervisor).await {
            Provisioned::Ready => {}
            Provisioned::Failed(e) => {
                guard.disarm();
                return Err(e);
            }
            Provisioned::Interrupted => {
                guard.disarm();
                return Ok(INTERRUPTED_EXIT_CODE);
            }
        }

        self.transition(RunState::Testing);
        let runner = Runner::new(&self.config.runner, &self.config.project.root);
        let outcome = tokio::select! {
            result = run_all(&runner, suites, &self.features) => Some(result),
            _ = shutdown_signal() => None,
        };

        self.teardown(&mut supervisor).await;
        guard.disarm();

        match outcome {
            Some(result) => result,
            None => Ok(INTERRUPTED_EXIT_CODE),
        }
    }
}

async fn run_all(runner: &Runner, suites: &[Suite], features: &FeatureSet) -> Result<i32> {
    let mut first_failure = 0;
    for &suite in suites {
        let code = runner.run(suite, features).await?;
        if code != 0 && first_failure == 0 {
            first_failure = code;
        }
    }
    Ok(first_failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::NoAcceleration;
    use std::path::PathBuf;

    #[test]
    fn test_valid_transitions() {
        use RunState::*;
        assert!(Idle.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Running));
        assert!(Running.can_transition_to(Testing));
        assert!(Testing.can_transition_to(TearingDown));
        assert!(TearingDown.can_transition_to(Idle));

        // failure paths
        assert!(Provisioning.can_transition_to(TearingDown));
        assert!(Running.can_transition_to(TearingDown));
        // `stop` from a fresh invocation
        assert!(Idle.can_transition_to(TearingDown));
    }

    #[test]
    fn test_invalid_transitions() {
        use RunState::*;
        assert!(!Idle.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Testing));
        assert!(!Provisioning.can_transition_to(Testing));
        assert!(!Testing.can_transition_to(Running));
        assert!(!TearingDown.can_transition_to(Provisioning));
        assert!(!Running.can_transition_to(Idle));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RunState::TearingDown.to_string(), "tearing-down");
        assert_eq!(RunState::Idle.to_string(), "idle");
    }

    #[test]
    fn test_guard_kills_unless_disarmed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PidRegistry::new(dir.path().join("e2e.pids"));

        registry.append(4194304).unwrap();
        {
            let mut guard = TeardownGuard::new(registry.clone());
            guard.disarm();
        }
        assert!(registry.exists());

        {
            let _guard = TeardownGuard::new(registry.clone());
        }
        assert!(!registry.exists());
    }

    #[tokio::test]
    async fn test_stop_without_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.project.workspace = dir.path().to_path_buf();

        let mut harness = Harness::new(config, &NoAcceleration).unwrap();
        assert_eq!(harness.stop().await.unwrap(), 0);
        assert_eq!(harness.state(), RunState::Idle);
    }

    #[test]
    fn test_relative_workspace_is_made_absolute() {
        let mut config = HarnessConfig::default();
        config.project.root = PathBuf::from(".");
        config.project.workspace = PathBuf::from("./tests/../tests/e2e_fixtures");

        let harness = Harness::new(config, &NoAcceleration).unwrap();
        let root = harness.workspace().root();
        assert!(root.is_absolute());
        assert_eq!(
            root,
            std::env::current_dir().unwrap().join("tests").join("e2e_fixtures")
        );
    }

    #[tokio::test]
    async fn test_build_failure_aborts_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.project.root = dir.path().to_path_buf();
        config.project.workspace = dir.path().join("ws");
        config.project.build_command = "sh -c 'exit 2' {features}".to_string();

        let mut harness = Harness::new(config, &NoAcceleration).unwrap();
        let err = harness.start().await.unwrap_err();

        assert_eq!(err.phase(), "build");
        assert_eq!(harness.state(), RunState::Idle);
        assert!(!harness.workspace().registry_path().exists());
        // nothing was provisioned
        assert!(!harness.workspace().configs_dir().exists());
    }
}
