//! Interruption handling
//!
//! Kept in its own test binary: the signal lands on the whole test process,
//! and every concurrently running harness would see it.

#![cfg(unix)]

mod common;

use common::*;
use proxyrig::capability::NoAcceleration;
use proxyrig::modes::{Harness, RunState, INTERRUPTED_EXIT_CODE};

#[tokio::test]
async fn test_sigterm_during_suite_tears_down_with_130() {
    let dir = tempfile::tempdir().unwrap();
    let live = LiveTopology::start().await;
    let mut config = harness_config(dir.path(), live.ports());
    let workspace = config.project.workspace_dir();
    // the runner records the live registry, then signals us
    config.runner.test_command = format!(
        "sh -c 'cat {}/e2e.pids > pids.txt; kill -TERM $PPID; sleep 5'",
        workspace.display()
    );

    let mut harness = Harness::new(config, &NoAcceleration).unwrap();
    let code = harness.run_suite(proxyrig::runner::Suite::Tests).await.unwrap();

    assert_eq!(code, INTERRUPTED_EXIT_CODE);
    assert_eq!(harness.state(), RunState::Idle);

    let pids: Vec<u32> = std::fs::read_to_string(dir.path().join("pids.txt"))
        .unwrap()
        .lines()
        .map(|l| l.parse().unwrap())
        .collect();
    assert_eq!(pids.len(), 3);
    assert_no_instances_left(&workspace, &pids);
}
