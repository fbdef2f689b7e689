//! tunnel - TCP port-forwarding tunnel
//!
//! Accepts connections on a local endpoint and relays each one to a fixed
//! remote endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use porttunnel::config::{CliOverrides, Config, ConfigManager};
use porttunnel::{Acceptor, ShutdownCoordinator};

/// CLI arguments for the tunnel
#[derive(Parser, Debug)]
#[command(name = "tunnel")]
#[command(about = "TCP port-forwarding tunnel")]
#[command(version)]
#[command(long_about = "
TCP port-forwarding tunnel

Accepts connections on LISTEN_HOST:LISTEN_PORT and forwards each one to
TARGET_HOST:TARGET_PORT. Payload bytes are relayed unmodified.

When TARGET_PORT is omitted the listen port is used on the target as well,
unless the configuration file or environment sets a target port.
IPv6 hosts may be given bare (::1) or bracketed ([::1]).

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults (0.0.0.0:25565 -> 127.0.0.1:25565)

Environment variables:
  TUNNEL_LISTEN            - Listen endpoint as host:port
  TUNNEL_TARGET            - Target endpoint as host:port
  TUNNEL_LISTEN_HOST       - Listen host (e.g., 0.0.0.0)
  TUNNEL_LISTEN_PORT       - Listen port
  TUNNEL_TARGET_HOST       - Target host or address
  TUNNEL_TARGET_PORT       - Target port
  TUNNEL_BUFFER_SIZE       - Per-direction relay buffer in bytes
  TUNNEL_SHUTDOWN_TIMEOUT  - Graceful shutdown timeout (e.g., 10s)
  TUNNEL_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Local host or address to listen on
    pub listen_host: Option<String>,

    /// Local port to listen on
    pub listen_port: Option<u16>,

    /// Remote host or address to forward to
    pub target_host: Option<String>,

    /// Remote port to forward to
    pub target_port: Option<u16>,

    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "tunnel.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Buffer size in bytes
    #[arg(long, help = "Per-direction relay buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Graceful shutdown timeout
    #[arg(long, value_parser = humantime::parse_duration, help = "Graceful shutdown timeout (e.g., 10s)")]
    pub shutdown_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen_host: self.listen_host.clone(),
            listen_port: self.listen_port,
            target_host: self.target_host.clone(),
            target_port: self.target_port,
            buffer_size: self.buffer_size,
            shutdown_timeout: self.shutdown_timeout,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Layered lowest to highest: defaults, environment, config file, CLI args
    let mut config = ConfigManager::load(&args.config)?;
    config.merge_with_cli_args(&args.overrides());

    init_tracing(&config, args.verbose)?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }

    info!("Starting tunnel v{}", env!("CARGO_PKG_VERSION"));
    log_summary(&config);

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let config = Arc::new(config);

    let acceptor = Acceptor::bind(Arc::clone(&config))
        .await
        .context("Failed to start tunnel")?;
    let registry = acceptor.registry();

    let shutdown_rx = shutdown_coordinator.subscribe();
    let mut server_handle = tokio::spawn(async move { acceptor.run(shutdown_rx).await });

    info!("Tunnel started, press Ctrl+C or send SIGTERM/SIGINT to shut down");

    tokio::select! {
        result = &mut server_handle => {
            // the accept loop only returns on its own when the listener died
            let result = result.context("Accept loop task failed")?;
            result.context("Listener failed")?;
            return Ok(());
        }
        signal_result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal_result {
                error!("Error setting up signal handlers: {}", e);
                shutdown_coordinator.trigger();
            }
        }
    }

    info!("Initiating graceful shutdown...");

    match server_handle.await {
        Ok(Err(e)) => warn!("Accept loop ended with error during shutdown: {}", e),
        Err(e) if !e.is_cancelled() => error!("Accept loop task failed: {}", e),
        _ => {}
    }

    shutdown_coordinator.drain(&registry).await;

    info!("Tunnel shutdown complete");
    Ok(())
}

fn log_summary(config: &Config) {
    info!("  Listen address: {}", config.listen);
    info!("  Target address: {}", config.target);
    info!("  Buffer size: {} bytes", config.relay.buffer_size);
    info!("  Shutdown timeout: {:?}", config.server.shutdown_timeout);
}

/// Initialize tracing/logging
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}
