//! Prometheus exporter for EVM chains: polls JSON-RPC endpoints for block
//! heights, balances and token activity and republishes them as gauges, with
//! health endpoints for Kubernetes probes.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use exporter_base::server::{serve_health, serve_metrics};
use exporter_base::settings::{load_chain_specs, render_chains_toml};
use exporter_base::trace::init_tracing;
use exporter_base::{ApplicationContext, Settings};

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_BIND_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "blockchain-exporter", version, about = "Prometheus exporter for EVM chains")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the configured chains and serve metrics (default).
    Run,
    /// Print the resolved settings and chain configuration, then exit.
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Config => print_config(settings),
        Command::Run => run(settings),
    }
}

fn print_config(settings: Settings) -> ExitCode {
    let chains = match load_chain_specs(&settings) {
        Ok(chains) => chains,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    println!("# resolved settings");
    println!("config_path = {:?}", settings.config_path);
    println!("log_level = {:?}", settings.log_level);
    println!("log_format = {:?}", settings.log_format);
    println!(
        "poll_default_interval = \"{}s\"",
        settings.poll_default_interval.as_secs()
    );
    println!(
        "max_failure_backoff_seconds = {}",
        settings.max_failure_backoff.as_secs()
    );
    println!(
        "rpc_request_timeout_seconds = {}",
        settings.rpc_request_timeout.as_secs_f64()
    );
    println!(
        "readiness_stale_threshold_seconds = {}",
        settings.readiness_stale_threshold.as_secs()
    );
    println!("health_port = {}", settings.health_port);
    println!("metrics_port = {}", settings.metrics_port);
    println!("warm_poll_enabled = {}", settings.warm_poll);
    println!();
    print!("{}", render_chains_toml(&chains));
    ExitCode::SUCCESS
}

fn run(settings: Settings) -> ExitCode {
    init_tracing(&settings);

    let chains = match load_chain_specs(&settings) {
        Ok(chains) => chains,
        Err(err) => {
            error!(error = %err, "fatal configuration error");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let ctx = match ApplicationContext::new(settings.clone()) {
            Ok(ctx) => ctx,
            Err(err) => {
                error!(error = %err, "failed to initialise");
                return ExitCode::FAILURE;
            }
        };

        // Bind both listeners before starting any polling so a bind failure
        // is reported fast and with its own exit code.
        let server_shutdown = CancellationToken::new();
        let health = serve_health(ctx.clone(), settings.health_port, server_shutdown.clone());
        let metrics = serve_metrics(
            ctx.metrics.clone(),
            settings.metrics_port,
            server_shutdown.clone(),
        );
        let ((health_addr, health_task), (metrics_addr, metrics_task)) = match (health, metrics) {
            (Ok(h), Ok(m)) => (h, m),
            (Err(err), _) | (_, Err(err)) => {
                error!(error = %err, "failed to bind listener");
                return ExitCode::from(EXIT_BIND_ERROR);
            }
        };
        info!(%health_addr, %metrics_addr, chains = chains.len(), "listeners bound");

        ctx.start(chains).await;
        info!("exporter started");

        if let Err(err) = wait_for_signals(&ctx).await {
            error!(error = %err, "signal handling failed");
        }

        info!("shutting down");
        ctx.shutdown().await;
        server_shutdown.cancel();
        let _ = health_task.await;
        let _ = metrics_task.await;
        ExitCode::SUCCESS
    })
}

/// Block until SIGTERM or SIGINT; apply reloads on SIGHUP in the meantime.
async fn wait_for_signals(ctx: &Arc<ApplicationContext>) -> eyre::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                match ctx.reload().await {
                    Ok(summary) => info!(
                        added = summary.added,
                        removed = summary.removed,
                        replaced = summary.replaced,
                        "reload applied"
                    ),
                    Err(err) => error!(error = %err, "reload rejected"),
                }
            }
        }
    }
}
