use crate::config::{Config, Pattern, RunConfig};
use crate::state::{StatusReport, TelemetryEvent};
use crate::supervisor::RunSupervisor;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod emitter;
mod pattern;
mod rate;
mod state;
mod supervisor;
mod telemetry;

use clap::{Args, Parser, Subcommand};

const DEFAULT_CONFIG: &str = "swell.toml";

/// Swell: shaped UDP load generator with a live telemetry stream
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane daemon
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Validate configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Perform a single run without the control plane and exit
    Run(RunArgs),
    /// Show the daemon's current status
    Status {
        /// API URL
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        api: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the configuration file supplying defaults
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,
    /// Bandwidth envelope
    #[arg(long, value_enum)]
    pattern: Option<Pattern>,
    /// Run length in seconds
    #[arg(long)]
    duration: Option<u64>,
    /// Peak bandwidth in Mbps
    #[arg(long)]
    bandwidth: Option<f64>,
    /// Destination host or IP
    #[arg(long)]
    target: Option<String>,
    /// Destination UDP port
    #[arg(long)]
    port: Option<u32>,
    /// Position of the bell peak within the run (0-1)
    #[arg(long)]
    peak: Option<f64>,
    /// Datagram size in bytes
    #[arg(long)]
    packet_size: Option<usize>,
}

impl RunArgs {
    fn apply(&self, base: RunConfig) -> RunConfig {
        RunConfig {
            pattern: self.pattern.unwrap_or(base.pattern),
            duration_secs: self.duration.unwrap_or(base.duration_secs),
            max_bandwidth_mbps: self.bandwidth.unwrap_or(base.max_bandwidth_mbps),
            target_host: self.target.clone().unwrap_or(base.target_host),
            target_port: self.port.unwrap_or(base.target_port),
            bell_peak_ratio: self.peak.unwrap_or(base.bell_peak_ratio),
            packet_size: self.packet_size.unwrap_or(base.packet_size),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve {
        config: DEFAULT_CONFIG.to_string(),
    }) {
        Commands::Serve { config } => serve(&config).await,
        Commands::Validate { config } => validate_config(&config),
        Commands::Run(args) => run_once(&args).await,
        Commands::Status { api } => show_status(&api).await,
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if path == DEFAULT_CONFIG && !Path::new(path).exists() {
        warn!("No '{}' found, using built-in defaults", path);
        return Ok(Config::default());
    }
    Ok(Config::load(path)?)
}

fn validate_config(path: &str) -> anyhow::Result<()> {
    match Config::load(path) {
        Ok(cfg) => {
            info!("Configuration '{}' is valid.", path);
            info!("Listen: {}", cfg.server.listen);
            info!(
                "Tick: {} ms, snapshots every {} ms",
                cfg.engine.tick_interval_ms, cfg.engine.snapshot_interval_ms
            );
            info!(
                "Default run: {:?} {} Mbps for {} s -> {}:{}",
                cfg.defaults.pattern,
                cfg.defaults.max_bandwidth_mbps,
                cfg.defaults.duration_secs,
                cfg.defaults.target_host,
                cfg.defaults.target_port
            );
            Ok(())
        }
        Err(e) => {
            error!("Configuration '{}' is INVALID: {}", path, e);
            Err(anyhow::anyhow!("Invalid config"))
        }
    }
}

async fn serve(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let supervisor = RunSupervisor::new(config.defaults.clone(), config.engine.clone());

    let listener = tokio::net::TcpListener::bind(config.server.listen).await?;
    info!("Control plane running at http://{}", config.server.listen);

    let app = api::router(supervisor.clone());
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API Server Error: {}", e);
        }
    });

    wait_for_shutdown().await?;

    supervisor.stop().await;
    server.abort();
    Ok(())
}

async fn run_once(args: &RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let run = args.apply(config.defaults.clone());
    let supervisor = RunSupervisor::new(run.clone(), config.engine.clone());

    let mut subscription = supervisor.subscribe();
    let reporter = tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            match event {
                TelemetryEvent::Snapshot(s) => info!(
                    mbps = %format!("{:.2}", s.current_bandwidth_mbps),
                    total_bytes = s.total_bytes_sent,
                    elapsed = %format!("{:.1}", s.elapsed_secs),
                    "Snapshot"
                ),
                TelemetryEvent::Terminated(t) => error!(reason = %t.reason, "Run terminated"),
                TelemetryEvent::State(_) => {}
            }
        }
    });

    supervisor.start(run)?;
    tokio::select! {
        _ = supervisor.wait_idle() => {}
        res = wait_for_shutdown() => {
            res?;
            supervisor.stop().await;
        }
    }
    reporter.abort();

    println!("{}", serde_json::to_string_pretty(&supervisor.status())?);
    Ok(())
}

async fn show_status(api_url: &str) -> anyhow::Result<()> {
    match reqwest::get(format!("{}/api/status", api_url)).await {
        Ok(resp) => {
            let status = resp.json::<StatusReport>().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Err(e) => eprintln!("Failed to connect to API: {}", e),
    }
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }
    Ok(())
}
