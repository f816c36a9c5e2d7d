//! tproute - transparent proxy control plane

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tproute::config::{Config, ConfigManager};
use tproute::control::Listeners;
use tproute::interception::MemoryInterception;
use tproute::{ControlPlane, ShutdownCoordinator};

/// CLI arguments for tproute
#[derive(Parser, Debug)]
#[command(name = "tproute")]
#[command(about = "tproute - transparent proxy control plane")]
#[command(version)]
#[command(long_about = "
tproute - transparent proxy control plane

Receives intercepted TCP and UDP traffic prefixed with its original
destination, routes it with a compiled policy and relays it through the
chosen outbound.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TPROUTE_PORT          - Listening port for TCP and UDP
  TPROUTE_DIAL_TIMEOUT  - Dial timeout (e.g., 5s)
  TPROUTE_POLICY_FILE   - Routing policy file
  TPROUTE_DATA_DIR      - Directory holding geosite/ and geoip/ lists
  TPROUTE_BIND_LINKS    - Comma separated links to bind
  TPROUTE_LOG_LEVEL     - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Port to listen on (overrides config file)
    #[arg(short, long, help = "Port to listen on")]
    pub port: Option<u16>,

    /// Link to bind, may be repeated
    #[arg(long = "bind-link", value_name = "IFNAME", help = "Link to bind")]
    pub bind_links: Vec<String>,

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

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Configuration priority: CLI args > config file > environment > defaults
    let from_file = args.config.exists();
    let mut config = if from_file {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };
    config.merge_with_cli_args(args.port, &args.bind_links, args.log_level.as_deref());

    init_tracing(&args, &config)?;

    info!("Starting tproute v{}", env!("CARGO_PKG_VERSION"));
    if from_file {
        info!("Configuration loaded from {}", args.config.display());
    } else {
        info!("Config file not found, using environment variables and defaults");
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        config
            .policy_text()
            .and_then(|text| {
                tproute::routing::RoutingCompiler::new(config.routing.data_dir.clone())
                    .compile(&text)
                    .map_err(Into::into)
            })
            .context("Routing policy is invalid")?;

        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Port: {}", config.server.port);
        info!("  Outbounds: {}", config.outbounds.len());
        info!("  Links: {}", config.interception.links.join(", "));
        info!("  Data dir: {}", config.routing.data_dir.display());
        return Ok(());
    }

    let port = config.server.port;
    let links = config.interception.links.clone();
    let plane = ControlPlane::new(config.clone(), Arc::new(interception_layer(&config)))?;

    let listeners = match start(&plane, &links, port).await {
        Ok(listeners) => listeners,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            if let Err(teardown) = plane.close().await {
                warn!("{}", teardown);
            }
            return Err(e);
        }
    };

    info!("tproute started, epoch {}", plane.epoch());
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    let shutdown = plane.shutdown().clone();
    tokio::spawn(async move {
        if let Err(e) = ShutdownCoordinator::listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
        }
        info!("Initiating graceful shutdown...");
        shutdown.trigger();
    });

    let result = plane.serve(listeners).await;
    if let Err(e) = &result {
        error!("Dispatch stopped: {:#}", e);
    }

    plane.close().await?;
    info!("Shutdown complete");
    result
}

/// Bind the configured links, then the listeners
async fn start(plane: &ControlPlane, links: &[String], port: u16) -> Result<Listeners> {
    for link in links {
        plane.bind_link(link)?;
    }
    plane.listen(port).await
}

/// Interception layer holding the statically configured links
fn interception_layer(config: &Config) -> MemoryInterception {
    config
        .interception
        .static_links
        .iter()
        .fold(MemoryInterception::new(), |layer, link| {
            layer.with_link(link.name.clone(), link.index, link.addresses.clone())
        })
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        config.monitoring.log_level.as_str()
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
        .init();

    Ok(())
}
