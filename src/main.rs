//! Tollgate - TLS-intercepting security testing proxy
//!
//! Headless runner: loads configuration, starts the proxy with the bundled
//! scan rules and logs findings until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tollgate::{Config, CoreEvent, ProxyCore, UserHint};

/// How long shutdown waits for queued passive scans
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// TLS-intercepting security testing proxy
#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(author, version, about = "TLS-intercepting security testing proxy", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Proxy listen port (overrides the configuration file)
    #[arg(short, long, env = "TOLLGATE_PORT")]
    port: Option<u16>,

    /// Proxy listen address (overrides the configuration file)
    #[arg(short, long, env = "TOLLGATE_ADDRESS")]
    address: Option<String>,

    /// CA keystore path (overrides the configuration file)
    #[arg(long, env = "TOLLGATE_CA_KEYSTORE")]
    ca_keystore: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TOLLGATE_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, env = "TOLLGATE_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "TOLLGATE_LOG_JSON")]
    log_json: bool,

    /// Write the root certificate to this path and exit
    #[arg(long)]
    export_ca: Option<PathBuf>,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");

    let config = load_config(&cli)?;

    if cli.validate_config {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    let core = match ProxyCore::new(config) {
        Ok(core) => core,
        Err(e) => {
            tracing::error!(error = %e, "{}", e.user_message());
            return Err(e).context("Failed to initialize");
        }
    };

    if let Some(path) = &cli.export_ca {
        core.ca()
            .export_root(path)
            .with_context(|| format!("Failed to export CA certificate to {:?}", path))?;
        tracing::info!(path = ?path, "Exported CA certificate");
        return Ok(());
    }

    run(core).await
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        let file_appender = if log_path.contains('/') || log_path.contains('\\') {
            let path = std::path::Path::new(log_path);
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let filename = path.file_name().and_then(|s| s.to_str()).unwrap_or("tollgate.log");
            RollingFileAppender::new(Rotation::DAILY, dir, filename)
        } else {
            let log_dir = Config::data_dir()
                .map(|d| d.join("logs"))
                .unwrap_or_else(|_| PathBuf::from("."));
            std::fs::create_dir_all(&log_dir).with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
            RollingFileAppender::new(Rotation::DAILY, log_dir, log_path)
        };

        if cli.log_json {
            subscriber
                .with(fmt::layer().json().with_writer(file_appender).with_ansi(false))
                .init();
        } else {
            subscriber
                .with(fmt::layer().with_writer(file_appender).with_ansi(false))
                .init();
        }
    } else if cli.log_json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }

    Ok(())
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.proxy.port = port;
    }
    if let Some(address) = &cli.address {
        config.proxy.address = address.clone();
    }
    if let Some(path) = &cli.ca_keystore {
        config.proxy.ca_keystore_path = Some(path.clone());
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("{}", e.user_hint()))
        .context("Invalid configuration")?;

    Ok(config)
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    println!("{}", toml);
    Ok(())
}

/// Serve until a shutdown signal arrives
async fn run(core: ProxyCore) -> Result<()> {
    core.register_builtins();
    let mut events = core.events().subscribe();

    let addr = core.start().await.map_err(|e| anyhow::anyhow!("{}", e.user_hint()))?;
    tracing::info!(addr = %addr, ca = core.ca().is_available(), "Proxy ready");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    core.shutdown(SHUTDOWN_GRACE).await;
    let alerts = core.alerts().count_by_risk();
    tracing::info!(history = core.history().len(), alerts = ?alerts, "Tollgate shut down");
    Ok(())
}

fn log_event(event: &CoreEvent) {
    match event {
        CoreEvent::AlertAdded(alert) => tracing::info!(
            plugin = alert.plugin_id,
            risk = alert.risk.as_str(),
            uri = %alert.uri,
            param = %alert.param,
            "{}",
            alert.name
        ),
        CoreEvent::CaUnavailable { host, reason } => {
            tracing::warn!(host = %host, reason = %reason, "CONNECT refused, CA unavailable")
        }
        CoreEvent::PassiveScanDegraded { dropped } => {
            tracing::warn!(dropped, "Passive scanning is dropping messages")
        }
        CoreEvent::ScanStateChanged { job_id, status } => {
            tracing::info!(job = %job_id, status = ?status, "Scan state changed")
        }
        _ => {}
    }
}

/// Handle shutdown signals
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, initiating shutdown"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating shutdown"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }
}
