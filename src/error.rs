//! Error taxonomy for the environment lifecycle

use std::io;
use std::path::PathBuf;

/// Result type used throughout this crate
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors that abort a run.
///
/// Capability probing and termination timeouts are deliberately absent:
/// both are logged and never fail a run.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Failed to write {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Failed to spawn instance '{instance}': {source}")]
    Spawn {
        instance: String,
        #[source]
        source: io::Error,
    },

    #[error("Instance '{instance}' is unhealthy: {reason}")]
    HealthCheck { instance: String, reason: String },

    #[error("Runner failed: {0}")]
    Runner(String),

    #[error("Invalid topology: {0}")]
    Topology(String),

    #[error("Invalid harness configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl HarnessError {
    /// Lifecycle phase the error belongs to, for diagnostics
    pub fn phase(&self) -> &'static str {
        match self {
            HarnessError::ConfigWrite { .. } => "config",
            HarnessError::CertificateGeneration(_) => "certificates",
            HarnessError::Build(_) => "build",
            HarnessError::Spawn { .. } => "spawn",
            HarnessError::HealthCheck { .. } => "health",
            HarnessError::Runner(_) => "runner",
            HarnessError::Topology(_) | HarnessError::Config(_) => "setup",
            HarnessError::Io(_) => "io",
        }
    }

    /// Whether the failure happens before any process is spawned
    pub fn is_pre_spawn(&self) -> bool {
        matches!(
            self,
            HarnessError::ConfigWrite { .. }
                | HarnessError::CertificateGeneration(_)
                | HarnessError::Build(_)
                | HarnessError::Topology(_)
                | HarnessError::Config(_)
        )
    }

    pub(crate) fn config_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        HarnessError::ConfigWrite {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(HarnessError::Build("no artifact".into()).phase(), "build");
        assert_eq!(
            HarnessError::HealthCheck {
                instance: "backend1".into(),
                reason: "503".into()
            }
            .phase(),
            "health"
        );
        assert_eq!(HarnessError::Topology("dup".into()).phase(), "setup");
    }

    #[test]
    fn test_pre_spawn_classification() {
        assert!(HarnessError::CertificateGeneration("x".into()).is_pre_spawn());
        assert!(HarnessError::config_write("/tmp/a", io::Error::other("denied")).is_pre_spawn());
        assert!(!HarnessError::Spawn {
            instance: "proxy".into(),
            source: io::Error::other("enoent"),
        }
        .is_pre_spawn());
        assert!(!HarnessError::Runner("exit 3".into()).is_pre_spawn());
    }

    #[test]
    fn test_error_messages() {
        let err = HarnessError::config_write(
            "/work/configs/proxy.toml",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/work/configs/proxy.toml"));
        assert!(msg.contains("denied"));

        let err = HarnessError::HealthCheck {
            instance: "backend2".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Instance 'backend2' is unhealthy: connection refused"
        );
    }
}
