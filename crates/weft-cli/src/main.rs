//! weft: bridge local tool subprocesses to remote hubs, and serve
//! them to browsers from a local hub.
//!
//! `weft bridge` runs the supervisor against a config store; `weft hub`
//! runs the WebSocket hub; `weft status` prints endpoint state and the
//! discovered tool catalog.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};

use weft_bridge::{BridgeConfig, BridgeSupervisor};
use weft_config::{ConfigStore, ConfigWatcher};
use weft_core::CatalogSnapshot;
use weft_hub::{Hub, HubConfig, RouterConfig, StaticTokenValidator};

/// weft: tool-server bridge and hub.
#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge: dial configured endpoints and splice tool
    /// subprocesses onto them.
    Bridge(BridgeArgs),

    /// Run the hub: accept browser and tool-server WebSocket clients.
    Hub(HubArgs),

    /// Show configured endpoints and the discovered tool catalog.
    Status(StatusArgs),
}

#[derive(Args)]
struct BridgeArgs {
    /// Path to the configuration store.
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    /// Where the tool-catalog snapshot is written.
    #[arg(long, env = "BRIDGE_CATALOG_PATH", default_value = "weft-catalog.json")]
    catalog: PathBuf,

    /// Reconnect delay cap, in seconds.
    #[arg(long, env = "BRIDGE_BACKOFF_MAX_SECONDS", default_value_t = 60)]
    backoff_max: u64,

    /// Subprocess graceful-exit window, in seconds.
    #[arg(long, env = "BRIDGE_SUBPROCESS_GRACE_SECONDS", default_value_t = 5)]
    grace: u64,

    /// Config poll interval, in seconds.
    #[arg(long, default_value_t = 5)]
    poll: u64,
}

#[derive(Args)]
struct HubArgs {
    /// Path to the configuration store (tool overrides).
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    /// Listener bind address.
    #[arg(long, env = "HUB_BIND_ADDR", default_value = "127.0.0.1:8900")]
    bind: String,

    /// Upgrade path for browser clients.
    #[arg(long, env = "HUB_BROWSER_PATH", default_value = "/")]
    browser_path: String,

    /// Upgrade path for tool servers.
    #[arg(long, env = "HUB_TOOL_PATH", default_value = "/mcp")]
    tool_path: String,

    /// Accepted browser token (repeatable). No tokens = open access.
    #[arg(long = "browser-token")]
    browser_tokens: Vec<String>,

    /// Accepted tool-pipe token (repeatable). No tokens = open access.
    #[arg(long = "tool-token")]
    tool_tokens: Vec<String>,
}

#[derive(Args)]
struct StatusArgs {
    /// Path to the configuration store.
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    /// Catalog snapshot location.
    #[arg(long, env = "BRIDGE_CATALOG_PATH", default_value = "weft-catalog.json")]
    catalog: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Bridge(args) => run_bridge(args).await,
        Commands::Hub(args) => run_hub(args).await,
        Commands::Status(args) => run_status(&args).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_bridge(args: BridgeArgs) -> Result<()> {
    let store = Arc::new(ConfigStore::open(&args.config)?);
    let watcher = match ConfigWatcher::spawn(Arc::clone(&store)) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "Config watcher unavailable, relying on polling");
            None
        },
    };

    let config = BridgeConfig {
        catalog_path: args.catalog,
        backoff_max: Duration::from_secs(args.backoff_max),
        subprocess_grace: Duration::from_secs(args.grace),
        poll_interval: Duration::from_secs(args.poll),
        ..BridgeConfig::default()
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let supervisor = BridgeSupervisor::new(store, config);
    let task = tokio::spawn(supervisor.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down bridge");
    let _ = shutdown_tx.send(());
    if tokio::time::timeout(Duration::from_secs(15), task)
        .await
        .is_err()
    {
        warn!("Bridge supervisor did not stop in time");
    }
    if let Some(watcher) = watcher {
        watcher.stop();
    }
    Ok(())
}

async fn run_hub(args: HubArgs) -> Result<()> {
    let store = Arc::new(ConfigStore::open(&args.config)?);
    let watcher = match ConfigWatcher::spawn(Arc::clone(&store)) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "Config watcher unavailable, overrides reload on restart only");
            None
        },
    };

    let mut validator = StaticTokenValidator::new();
    for token in args.browser_tokens {
        validator = validator.with_browser_token(token);
    }
    for token in args.tool_tokens {
        validator = validator.with_tool_token(token);
    }

    let config = HubConfig {
        bind_addr: args.bind,
        browser_path: args.browser_path,
        tool_path: args.tool_path,
    };
    let mut hub = Hub::start(config, RouterConfig::default(), Arc::new(validator)).await?;
    hub.attach_config_store(Arc::clone(&store));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down hub");
    hub.stop().await;
    if let Some(watcher) = watcher {
        watcher.stop();
    }
    Ok(())
}

async fn run_status(args: &StatusArgs) -> Result<()> {
    let store = ConfigStore::open(&args.config)?;

    println!("Endpoints:");
    let endpoints = store.endpoints().await;
    if endpoints.is_empty() {
        println!("  (none configured)");
    }
    for endpoint in endpoints {
        let enabled = if endpoint.enabled { "enabled" } else { "disabled" };
        println!(
            "  {} [{}] {} ({})",
            endpoint.name, enabled, endpoint.url, endpoint.connection_status
        );
        if let Some(error) = &endpoint.last_error {
            println!("    last error: {error}");
        }
        if let Some(at) = endpoint.last_connected_at {
            println!("    last connected: {at}");
        }
    }

    println!("Servers:");
    let servers = store.servers().await;
    if servers.is_empty() {
        println!("  (none configured)");
    }
    for server in servers {
        let state = if server.disabled { "disabled" } else { "enabled" };
        println!(
            "  {} [{}] {} {}",
            server.name,
            state,
            server.command.as_deref().unwrap_or("-"),
            server.args.join(" ")
        );
    }

    match CatalogSnapshot::read(&args.catalog) {
        Ok(snapshot) => {
            println!("Discovered tools:");
            if snapshot.servers.is_empty() {
                println!("  (none discovered)");
            }
            for (server, tools) in &snapshot.servers {
                for tool in tools {
                    println!("  {}/{}: {}", server, tool.name, tool.description);
                }
            }
        },
        Err(_) => {
            println!("Discovered tools: (no snapshot at {})", args.catalog.display());
        },
    }

    Ok(())
}
