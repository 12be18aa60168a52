//! # OCPP Charge Point CLI
//!
//! Runs one charge point session against a central system: connect, boot,
//! a single charge cycle, then an orderly shutdown.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use ocpp_cp::{
    ChargeCycleOutcome, ChargePointConfig, ChargePointError, ChargePointResult, ErrorSeverity,
    LogFormat, LoggingConfig, LoopbackCentralSystem, LoopbackOptions, ReconnectConfig,
    SessionController,
};
use ocpp_transport::{MemoryTransport, Transport, TransportConfig, WebSocketTransport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "ocpp-cp")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, boot, run one charge cycle and shut down
    Run(RunArgs),
    /// Write a default configuration file
    Config(ConfigArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file path (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override central system URL
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// Override charge point ID
    #[arg(short = 'i', long)]
    id: Option<String>,

    /// Override the id tag used for the charge cycle
    #[arg(short = 't', long)]
    id_tag: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Talk to an in-process central system instead of the network
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ConfigArgs {
    /// Output file path
    #[arg(short, long, default_value = "ocpp-cp.toml")]
    output: PathBuf,

    /// Central system URL
    #[arg(short, long)]
    url: Option<String>,

    /// Charge point ID
    #[arg(short, long)]
    id: Option<String>,

    /// Number of connectors
    #[arg(short = 'n', long)]
    connectors: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Config(args) => config_command(args),
    }
}

fn load_config(path: Option<&Path>) -> Result<ChargePointConfig> {
    match path {
        Some(path) if path.exists() => Ok(ChargePointConfig::from_file(path)?),
        Some(path) => anyhow::bail!("Configuration file not found: {}", path.display()),
        None => Ok(ChargePointConfig::default()),
    }
}

async fn run_command(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(url) = args.url {
        config.central_system_url = url;
    }
    if let Some(id) = args.id {
        config.charge_point_id = id;
    }
    if let Some(id_tag) = args.id_tag {
        config.demo.id_tag = id_tag;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.format = LogFormat::Json;
    }

    init_logging(&config.logging)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

    info!("Charge point {} starting", config.charge_point_id);
    info!("  Central system: {}", config.endpoint());
    info!("  Connectors: {}", config.connector_count);
    if args.dry_run {
        info!("  Dry run: using in-process central system");
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let error = match run_session(&config, args.dry_run).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let max_attempts = config.reconnect.max_attempts;
        if !error.is_recoverable() || (max_attempts > 0 && attempt >= max_attempts) {
            error!(
                "Session failed after {} attempt(s) [{} {}]: {}",
                attempt,
                error.severity(),
                error.category(),
                error
            );
            return Err(error.into());
        }

        let delay = retry_delay(&config.reconnect, attempt, &error);
        let category = error.category();
        if error.severity() >= ErrorSeverity::Critical {
            error!(
                "Session attempt {} failed ({}): {}; retrying in {:?}",
                attempt, category, error, delay
            );
        } else {
            warn!(
                "Session attempt {} failed ({}): {}; retrying in {:?}",
                attempt, category, error, delay
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, giving up");
                return Ok(());
            }
        }
    }
}

/// Backoff for the next attempt, stretched to the error's own hint but never
/// past the configured maximum
fn retry_delay(reconnect: &ReconnectConfig, attempt: u32, error: &ChargePointError) -> Duration {
    let backoff = reconnect.delay_for(attempt);
    let Some(hint) = error.suggested_retry_delay() else {
        return backoff;
    };
    backoff
        .max(Duration::from_millis(hint))
        .min(Duration::from_secs(reconnect.max_delay_secs).max(backoff))
}

async fn run_session(config: &ChargePointConfig, dry_run: bool) -> ChargePointResult<()> {
    let mut loopback = None;
    let transport: Arc<dyn Transport> = if dry_run {
        let (transport, peer) = MemoryTransport::pair();
        let csms = LoopbackCentralSystem::new(LoopbackOptions::default());
        loopback = Some(csms.spawn(Arc::new(peer)));
        Arc::new(transport)
    } else {
        Arc::new(WebSocketTransport::new(TransportConfig::default()))
    };

    let session = SessionController::new(config.clone(), transport)?;
    let result = drive(&session, config).await;
    let closed = session.shutdown().await;

    if let Some(handle) = loopback {
        handle.abort();
    }
    result.and(closed)
}

async fn drive(session: &SessionController, config: &ChargePointConfig) -> ChargePointResult<()> {
    session.start().await?;

    let demo = &config.demo;
    tokio::select! {
        outcome = session.run_charge_cycle(demo.connector_id, &demo.id_tag) => match outcome? {
            ChargeCycleOutcome::Completed(transaction) => info!(
                "Transaction {} complete: {} Wh, stopped with {}",
                transaction.wire_id(),
                transaction.energy_consumed(),
                transaction.stop_reason.map(|r| r.to_string()).unwrap_or_default()
            ),
            ChargeCycleOutcome::NotAuthorized(status) => {
                warn!("Id tag {} not authorized ({:?})", demo.id_tag, status)
            }
        },
        _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
    }
    Ok(())
}

fn config_command(args: ConfigArgs) -> Result<()> {
    let mut config = ChargePointConfig::default();
    if let Some(url) = args.url {
        config.central_system_url = url;
    }
    if let Some(id) = args.id {
        config.charge_point_id = id;
    }
    if let Some(connectors) = args.connectors {
        config.connector_count = connectors;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

    config.to_file(&args.output)?;

    println!("Configuration file generated: {}", args.output.display());
    println!("  charge_point_id: {}", config.charge_point_id);
    println!("  central_system_url: {}", config.central_system_url);
    println!("  connector_count: {}", config.connector_count);
    println!("  demo.id_tag: {}", config.demo.id_tag);
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        other => anyhow::bail!("Unknown log level: {}", other),
    };

    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()));
    match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "ocpp-cp",
            "run",
            "--url",
            "ws://localhost:9000/ocpp",
            "--id",
            "CP7",
            "--id-tag",
            "TAG7",
            "--json-logs",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.url.as_deref(), Some("ws://localhost:9000/ocpp"));
        assert_eq!(args.id.as_deref(), Some("CP7"));
        assert_eq!(args.id_tag.as_deref(), Some("TAG7"));
        assert!(args.json_logs);
        assert!(args.dry_run);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_retry_delay_follows_error_hint() {
        let reconnect = ReconnectConfig {
            initial_delay_secs: 1,
            max_delay_secs: 20,
            max_attempts: 5,
        };

        let timeout = ChargePointError::timeout("BootNotification", 30_000);
        assert_eq!(retry_delay(&reconnect, 1, &timeout), Duration::from_secs(1));
        assert_eq!(retry_delay(&reconnect, 3, &timeout), Duration::from_secs(4));

        let lost = ChargePointError::connection_lost("reset by peer");
        assert_eq!(retry_delay(&reconnect, 1, &lost), Duration::from_secs(5));

        let boot = ChargePointError::boot_failed("rejected by central system");
        assert_eq!(retry_delay(&reconnect, 1, &boot), Duration::from_secs(20));

        let protocol = ChargePointError::protocol("bad frame");
        assert_eq!(retry_delay(&reconnect, 2, &protocol), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
        assert_eq!(load_config(None).unwrap(), ChargePointConfig::default());
    }

    #[test]
    fn test_config_command_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("cp.toml");
        config_command(ConfigArgs {
            output: output.clone(),
            url: Some("wss://csms.example.com/ocpp".to_string()),
            id: Some("CP9".to_string()),
            connectors: Some(2),
        })
        .unwrap();

        let written = ChargePointConfig::from_file(&output).unwrap();
        assert_eq!(written.charge_point_id, "CP9");
        assert_eq!(written.connector_count, 2);
        assert_eq!(written.central_system_url, "wss://csms.example.com/ocpp");
    }
}
