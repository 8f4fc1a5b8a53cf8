//! proxyrig - provision, check and tear down a proxy test environment
//!
//! Usage:
//!   proxyrig start      Build if needed, spawn the topology, check health
//!   proxyrig stop       Terminate every recorded instance
//!   proxyrig restart    stop, then start
//!   proxyrig health     Check the running topology once
//!   proxyrig test       start, run the integration tests, stop
//!   proxyrig clean      stop, then remove generated files (keeps certs)

use proxyrig::cli::{finish, init_tracing, load_harness, USAGE_EXIT_CODE};
use proxyrig::runner::Suite;
use proxyrig::{PKG_NAME, VERSION};
use std::process::ExitCode;

const USAGE: &str = "\
Usage: proxyrig <command>

Commands:
  start      Build if needed, spawn backends and proxy, check health
  stop       Terminate every recorded instance
  restart    Stop, then start
  health     Check the running topology once
  test       Start, run the integration test suite, stop
  clean      Stop, then remove configs, static content and logs
  help       Show this message

Configuration is read from $PROXYRIG_CONFIG or ./proxyrig.toml.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Restart,
    Health,
    Test,
    Clean,
    Help,
    Version,
}

fn parse_command(args: &[String]) -> Option<Command> {
    let [arg] = args else {
        return None;
    };

    let command = match arg.as_str() {
        "start" => Command::Start,
        "stop" => Command::Stop,
        "restart" => Command::Restart,
        "health" => Command::Health,
        "test" => Command::Test,
        "clean" => Command::Clean,
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        _ => return None,
    };
    Some(command)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let Some(command) = parse_command(&args) else {
        eprintln!("{}", USAGE);
        return ExitCode::from(USAGE_EXIT_CODE);
    };

    match command {
        Command::Help => {
            println!("{}", USAGE);
            return ExitCode::SUCCESS;
        }
        Command::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    init_tracing();
    finish(run(command).await)
}

async fn run(command: Command) -> anyhow::Result<i32> {
    let mut harness = load_harness()?;

    let code = match command {
        Command::Start => harness.start().await?,
        Command::Stop => harness.stop().await?,
        Command::Restart => harness.restart().await?,
        Command::Health => harness.health().await?,
        Command::Test => harness.run_suite(Suite::Tests).await?,
        Command::Clean => harness.clean().await?,
        Command::Help | Command::Version => 0,
    };
    Ok(code)
}
