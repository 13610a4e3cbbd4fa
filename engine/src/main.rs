//! FinSentry engine daemon entry point
//!
//! Runs the monitoring engine as a long-lived service, with helper
//! subcommands for configuration validation and health inspection.

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use finsentry_engine::config::LoggingConfig;
use finsentry_engine::{MetricsProvider, MonitoringConfig, MonitoringEngine, SystemMetricsProvider};

/// FinSentry engine command line interface
#[derive(Parser)]
#[command(name = "finsentry-engine")]
#[command(about = "FinSentry observability and incident-alerting engine")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (overrides the configured level)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring engine
    Start,

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// One-shot system health snapshot
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Configuration first: the logging section feeds subscriber setup.
    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = initialize_logging(&cli, &config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let result = match &cli.command {
        Some(Commands::Config { show }) => handle_config(config, *show),
        Some(Commands::Health) => health_snapshot(config),
        Some(Commands::Start) | None => run_engine(config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

/// Initialize logging from the config's logging section, with CLI
/// flags taking precedence
fn initialize_logging(cli: &Cli, logging: &LoggingConfig) -> Result<()> {
    let level = cli.log_level.as_deref().unwrap_or(&logging.level);
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("finsentry_engine={}", log_level).parse()?)
        .add_directive("tokio=warn".parse()?);

    if !logging.console {
        tracing_subscriber::registry().with(filter).init();
        return Ok(());
    }

    let json = cli.json_logs || logging.format.eq_ignore_ascii_case("json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Load configuration from file, defaults, and environment
fn load_configuration(cli: &Cli) -> Result<MonitoringConfig> {
    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path.display());
        MonitoringConfig::from_file(config_path)?
    } else {
        let default_path = MonitoringConfig::default_config_path();
        if default_path.exists() {
            info!("Loading configuration from: {}", default_path.display());
            MonitoringConfig::from_file(&default_path)?
        } else {
            info!("Using default configuration");
            MonitoringConfig::default()
        }
    };

    let config = config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Run the engine until a shutdown signal arrives
async fn run_engine(config: MonitoringConfig) -> Result<()> {
    let mut engine = MonitoringEngine::new(config)?;
    engine.start();
    info!("Engine running; waiting for shutdown signal");

    wait_for_shutdown().await?;

    info!("Initiating graceful shutdown");
    engine.stop().await;
    info!("Engine stopped");
    Ok(())
}

/// Handle configuration subcommand
fn handle_config(config: MonitoringConfig, show: bool) -> Result<()> {
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    } else {
        config.validate()?;
        println!("Configuration is valid");
    }
    Ok(())
}

/// Print a one-shot system health snapshot
fn health_snapshot(config: MonitoringConfig) -> Result<()> {
    config.validate()?;

    let provider = SystemMetricsProvider::new();
    let state = provider.snapshot();

    println!("FinSentry Health Snapshot");
    println!("=========================");
    println!("CPU usage:          {:.1}%", state.cpu_usage);
    println!("Memory usage:       {:.1}%", state.memory_usage_pct);
    println!("Disk usage:         {:.1}%", state.disk_usage_pct);
    println!("Active threads:     {}", state.active_threads);
    println!("Open descriptors:   {}", state.open_file_descriptors);
    println!("Network reachable:  {}", state.network_reachable);
    Ok(())
}

/// Block until SIGTERM or SIGINT
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, initiating graceful shutdown");
        }
    }

    Ok(())
}
