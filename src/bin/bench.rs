//! proxyrig-bench - run benchmarks against a freshly provisioned topology
//!
//! Usage:
//!   proxyrig-bench <target>   Run one benchmark target
//!   proxyrig-bench all        Run every target, report the first failure

use proxyrig::cli::{finish, init_tracing, load_harness, USAGE_EXIT_CODE};
use proxyrig::runner::{BenchTarget, Suite};
use std::process::ExitCode;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selection {
    One(BenchTarget),
    All,
    Help,
}

fn usage() -> String {
    let targets = BenchTarget::ALL
        .iter()
        .map(|t| format!("  {}", t))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Usage: proxyrig-bench <target|all>\n\nTargets:\n{}\n  all\n\n\
         The HTTP/3 target always runs without kernel TLS.",
        targets
    )
}

fn parse_selection(args: &[String]) -> Option<Selection> {
    let [arg] = args else {
        return None;
    };

    match arg.as_str() {
        "all" => Some(Selection::All),
        "help" | "--help" | "-h" => Some(Selection::Help),
        name => name.parse().ok().map(Selection::One),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let suites: Vec<Suite> = match parse_selection(&args) {
        None => {
            eprintln!("{}", usage());
            return ExitCode::from(USAGE_EXIT_CODE);
        }
        Some(Selection::Help) => {
            println!("{}", usage());
            return ExitCode::SUCCESS;
        }
        Some(Selection::One(target)) => vec![Suite::Bench(target)],
        Some(Selection::All) => BenchTarget::ALL.iter().copied().map(Suite::Bench).collect(),
    };

    init_tracing();
    finish(run(&suites).await)
}

async fn run(suites: &[Suite]) -> anyhow::Result<i32> {
    let mut harness = load_harness()?;
    Ok(harness.run_suites(suites).await?)
}
