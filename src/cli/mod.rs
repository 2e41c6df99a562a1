//! CLI command handling
//!
//! Parses the command line, runs the relay and the driver, and prints the
//! outcome. A test author's binary calls [`run`] with its own suites.

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use crate::commands::Commands;
use crate::common::{config::Config, logging, Error, Result};
use crate::driver::{Driver, OnlineRequest, RunSummary, WalkRequest};
use crate::executor::{ExecutorKind, SuiteCatalog};
use crate::relay::RelayServer;
use crate::types::ModelRef;

/// How long a stopping relay may take before the CLI gives up on it
const RELAY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "walker", about = "Model-based test runner with a live viewer relay")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Parse arguments, run the command and map the outcome to an exit code
pub async fn run(catalog: SuiteCatalog) -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { .. } => {
            if let Some(path) = logging::init_server() {
                tracing::debug!(path = %path.display(), "Logging to file");
            }
        }
        _ => logging::init_cli(),
    }

    match dispatch(cli.command, Arc::new(catalog)).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {}", "Error during test execution:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Dispatch a CLI command; `Ok(false)` means the run finished but failed
pub async fn dispatch(command: Commands, catalog: Arc<SuiteCatalog>) -> Result<bool> {
    match command {
        Commands::Serve { host, port } => {
            let mut config = Config::load()?;
            override_relay(&mut config, host, port);

            let server = RelayServer::bind(&relay_addr(&config)).await?;
            let addr = server.local_addr()?;
            println!("{} ws://{}", "Relay listening on".green().bold(), addr);
            println!("Press Ctrl-C to stop");

            server.serve(shutdown_signal()).await?;
            Ok(true)
        }

        Commands::Online {
            test_package,
            models,
            host,
            port,
            executor,
            start_element,
            gw_host,
            gw_port,
            blocked,
            report_path_file,
        } => {
            let mut config = Config::load()?;
            override_relay(&mut config, host, port);
            if let Some(gw_host) = gw_host {
                config.engine.host = gw_host;
            }
            if let Some(gw_port) = gw_port {
                config.engine.port = gw_port;
            }

            let executor: ExecutorKind = executor.parse()?;
            let models = pair_models(&models)?;

            with_relay(&config, |relay_url| {
                let driver = Driver::new(config.clone(), catalog);
                let request = OnlineRequest {
                    test_package,
                    models,
                    executor,
                    relay_url,
                    blocked,
                    start_element,
                    report_path_file,
                };
                async move { driver.online(request, shutdown_signal()).await }
            })
            .await
        }

        Commands::Walk {
            test_package,
            steps_file,
            host,
            port,
            executor,
            report_path_file,
        } => {
            let mut config = Config::load()?;
            override_relay(&mut config, host, port);
            let executor: ExecutorKind = executor.parse()?;

            with_relay(&config, |relay_url| {
                let driver = Driver::new(config.clone(), catalog);
                let request = WalkRequest {
                    test_package,
                    steps_file,
                    executor,
                    relay_url,
                    report_path_file,
                };
                async move { driver.walk(request, shutdown_signal()).await }
            })
            .await
        }
    }
}

fn override_relay(config: &mut Config, host: Option<String>, port: Option<u16>) {
    if let Some(host) = host {
        config.relay.host = host;
    }
    if let Some(port) = port {
        config.relay.port = port;
    }
}

fn relay_addr(config: &Config) -> String {
    format!("{}:{}", config.relay.host, config.relay.port)
}

/// Group `-m MODEL GENERATOR` values into model references
fn pair_models(values: &[String]) -> Result<Vec<ModelRef>> {
    values
        .chunks(2)
        .map(|pair| match pair {
            [path, generator] => Ok(ModelRef::new(path, generator)),
            _ => Err(Error::Config(
                "each --model needs a model file and a generator".to_string(),
            )),
        })
        .collect()
}

/// Run a driver command next to a relay that lives exactly as long as the run
async fn with_relay<F, Fut>(config: &Config, run: F) -> Result<bool>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<RunSummary>>,
{
    let server = RelayServer::bind(&relay_addr(config)).await?;
    let addr = server.local_addr()?;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let relay = tokio::spawn(server.serve(async move {
        let _ = stop_rx.await;
    }));

    println!("{}", "Starting test execution...".green().bold());
    println!("{} ws://{}", "Viewer relay at:".cyan().bold(), addr);

    let outcome = run(format!("ws://{}", addr)).await;

    let _ = stop_tx.send(());
    match tokio::time::timeout(RELAY_STOP_TIMEOUT, relay).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("Relay stopped with error: {}", e),
        Ok(Err(e)) => tracing::warn!("Relay task failed: {}", e),
        Err(_) => tracing::warn!("Relay did not stop in time"),
    }

    match outcome {
        Ok(summary) => {
            print_summary(&summary);
            Ok(summary.status)
        }
        Err(Error::Interrupted) => {
            println!("\n{}", "Test execution interrupted by user".yellow());
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn print_summary(summary: &RunSummary) {
    let status = if summary.status {
        "passed".green().bold()
    } else {
        "failed".red().bold()
    };
    println!("\nTest execution completed with status: {}", status);
    println!(
        "  Steps: {}  Failures: {}",
        summary.steps,
        summary.failures.to_string().dimmed()
    );
    if let Some(port) = summary.engine_port {
        println!("  Engine port: {}", port.to_string().dimmed());
    }
    if let Some(reason) = &summary.aborted {
        println!("  {} {}", "Aborted:".red(), reason);
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT (Ctrl+C)"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_models() {
        let values: Vec<String> = ["login.json", "random(never)", "cart.json", "quick_random"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let models = pair_models(&values).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[1], ModelRef::new("cart.json", "quick_random"));

        assert!(pair_models(&values[..3]).is_err());
    }

    #[test]
    fn test_parse_online_command() {
        let cli = Cli::try_parse_from([
            "walker",
            "online",
            "tests",
            "-m",
            "login.json",
            "random(vertex_coverage(100))",
            "-m",
            "cart.json",
            "random(edge_coverage(100))",
            "--gw-port",
            "9000",
            "-b",
        ])
        .unwrap();

        match cli.command {
            Commands::Online {
                models,
                gw_port,
                blocked,
                executor,
                ..
            } => {
                assert_eq!(models.len(), 4);
                assert_eq!(gw_port, Some(9000));
                assert!(blocked);
                assert_eq!(executor, "in-process");
            }
            _ => panic!("expected online command"),
        }
    }

    #[test]
    fn test_online_requires_model() {
        assert!(Cli::try_parse_from(["walker", "online", "tests"]).is_err());
    }

    #[test]
    fn test_override_relay() {
        let mut config = Config::default();
        override_relay(&mut config, None, Some(6000));
        assert_eq!(relay_addr(&config), "localhost:6000");
    }
}
