//! Locates the proxy binary, building it for the selected features when
//! no artifact exists yet

use crate::capability::FeatureSet;
use crate::config::ProjectConfig;
use crate::error::{HarnessError, Result};
use crate::runner::render_command;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Build output lines kept for the error message
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    project_root: PathBuf,
    candidates: Vec<PathBuf>,
    build_command: String,
}

impl ArtifactBuilder {
    pub fn new(
        project_root: impl Into<PathBuf>,
        candidates: Vec<PathBuf>,
        build_command: impl Into<String>,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            candidates,
            build_command: build_command.into(),
        }
    }

    /// Builder for `[project]`; without explicit candidates the project's
    /// own release output is tried before its parent workspace's
    pub fn from_config(project: &ProjectConfig) -> Self {
        let candidates = if project.candidates.is_empty() {
            default_candidates(&project.root, &project.binary)
        } else {
            project.candidates.clone()
        };
        Self::new(&project.root, candidates, &project.build_command)
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// First candidate that exists
    pub fn find_existing(&self) -> Option<PathBuf> {
        self.candidates.iter().find(|c| c.is_file()).cloned()
    }

    /// Path to a usable binary, building it if necessary.
    ///
    /// This may take minutes on a cold build.
    pub async fn ensure(&self, features: &FeatureSet) -> Result<PathBuf> {
        if let Some(found) = self.find_existing() {
            info!(binary = %found.display(), "Using existing build artifact");
            return Ok(found);
        }

        info!(features = %features, "No build artifact found, building");
        self.build(features).await?;

        self.find_existing().ok_or_else(|| {
            let searched = self
                .candidates
                .iter()
                .map(|c| c.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            HarnessError::Build(format!("build succeeded but no artifact at: {}", searched))
        })
    }

    async fn build(&self, features: &FeatureSet) -> Result<()> {
        let start = Instant::now();
        let features = features.cargo_list();
        let argv = render_command(&self.build_command, &[("features", features.as_str())])
            .map_err(HarnessError::Build)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HarnessError::Build("build command is empty".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| HarnessError::Build(format!("failed to run '{}': {}", program, e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(HarnessError::Build("build output not captured".to_string()));
        };
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        let mut keep = |line: String| {
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        };

        let (mut stdout_done, mut stderr_done) = (false, false);
        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout_reader.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            info!(target: "proxyrig::build", "{}", line);
                            keep(line);
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            warn!("Error reading stdout: {}", e);
                            stdout_done = true;
                        }
                    }
                }
                line = stderr_reader.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            // cargo reports progress on stderr
                            info!(target: "proxyrig::build", "{}", line);
                            keep(line);
                        }
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            warn!("Error reading stderr: {}", e);
                            stderr_done = true;
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| HarnessError::Build(format!("failed to wait for build: {}", e)))?;
        let duration = start.elapsed().as_secs_f64();

        if status.success() {
            info!(duration_secs = %duration, "Build completed successfully");
            Ok(())
        } else {
            let code = status.code().unwrap_or(-1);
            error!(exit_code = code, duration_secs = %duration, "Build failed");
            let output = tail.into_iter().collect::<Vec<_>>().join("\n");
            Err(HarnessError::Build(format!(
                "build exited with code {}\n{}",
                code, output
            )))
        }
    }
}

/// `<root>/target/release/<binary>` then `<root>/../target/release/<binary>`
pub fn default_candidates(root: &Path, binary: &str) -> Vec<PathBuf> {
    vec![
        root.join("target").join("release").join(binary),
        root.join("..").join("target").join("release").join(binary),
    ]
}
