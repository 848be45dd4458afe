//! devoured: wrap a misbehaving server binary in a supervised service
//!
//! One binary, mode-driven: `devoured daemon` runs the supervisor,
//! everything else is a thin client issuing a single request against the
//! control socket.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::process;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use devoured::config::Environment;
use devoured::daemon::{ControlClient, Daemon};
use devoured::protocol::{Request, RequestKind, ReturnCode};
use devoured::signal::ShutdownFlag;

/// Exit status for setup and usage failures, before any loop runs
const INVALID_STATUS: i32 = -1;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let code = match run(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            INVALID_STATUS
        }
    };
    process::exit(code);
}

fn run(args: &[String]) -> Result<i32> {
    if args.len() < 2 {
        print_usage();
        return Ok(INVALID_STATUS);
    }

    match args[1].as_str() {
        "daemon" => run_daemon(),
        "status" => client_request(
            RequestKind::Status,
            args.get(2).cloned().unwrap_or_default(),
        ),
        "start" => client_request(RequestKind::Start, required_target(args)?),
        "stop" => client_request(RequestKind::Stop, required_target(args)?),
        "enable" => client_request(RequestKind::Enable, required_target(args)?),
        "disable" => client_request(RequestKind::Disable, required_target(args)?),
        "-h" | "--help" => {
            print_usage();
            Ok(0)
        }
        other => Err(anyhow!("unknown command '{other}'")),
    }
}

fn required_target(args: &[String]) -> Result<String> {
    args.get(2)
        .cloned()
        .ok_or_else(|| anyhow!("missing service name"))
}

fn run_daemon() -> Result<i32> {
    let environment = Environment::discover().context("environment discovery failed")?;
    let config = environment.load_config().context("configuration unreadable")?;
    let shutdown = ShutdownFlag::new();
    shutdown
        .register()
        .context("failed to install signal handlers")?;

    let daemon =
        Daemon::new(config, environment, shutdown).context("daemon setup failed")?;
    daemon.run().context("daemon loop failed")?;
    info!("daemon exited cleanly");
    Ok(0)
}

fn client_request(kind: RequestKind, target: String) -> Result<i32> {
    let environment = Environment::discover().context("environment discovery failed")?;
    let config = environment.load_config().context("configuration unreadable")?;
    let client = ControlClient::new(environment.socket_path(&config))?;

    let request = Request::new(0, kind, target, "");
    let response = client
        .request(&request, CLIENT_TIMEOUT)
        .with_context(|| format!("no response from daemon at {}", client.socket_path().display()))?;

    println!("{response}");
    Ok(if response.code == ReturnCode::Ok.as_u8() {
        0
    } else {
        1
    })
}

fn print_usage() {
    println!("devoured - service supervisor");
    println!();
    println!("Usage:");
    println!("  devoured daemon             Run the supervisor daemon");
    println!("  devoured status [service]   Report daemon or service state");
    println!("  devoured start <service>    Start a configured service");
    println!("  devoured stop <service>     Stop a running service");
    println!("  devoured enable <service>   Enable a service (reserved)");
    println!("  devoured disable <service>  Disable a service (reserved)");
    println!();
    println!("The control socket lives under the configured socket directory,");
    println!("suffixed with your user id.");
}
