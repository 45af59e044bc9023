//! Phaze Client: PhazeVPN tunnel client
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! and drives a ConnectionManager from the command line.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use phaze_tunnel::{ConnectionManager, ConnectionState, SessionKey, TunnelConfig};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How often the connection state is checked
const STATE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(name = "phaze-client", version, about = "PhazeVPN tunnel client")]
struct Cli {
    /// More logging (debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring the tunnel up and keep it running until Ctrl-C
    Connect(ConnectArgs),
    /// Print a fresh base64 session key
    Keygen,
    /// Validate a configuration file
    Check {
        /// Configuration file (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Debug, Args)]
struct ConnectArgs {
    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: PathBuf,

    /// Override the server host
    #[arg(long)]
    server: Option<String>,

    /// Override the server port
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between status reports
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "phaze_tunnel=debug,phaze_client=debug"
    } else {
        "phaze_tunnel=info,phaze_client=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    match cli.command {
        Command::Connect(args) => connect(args).await,
        Command::Keygen => {
            println!("{}", SessionKey::generate().to_base64());
            Ok(())
        }
        Command::Check { config } => check(config),
    }
}

fn load(path: &Path) -> Result<TunnelConfig> {
    TunnelConfig::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let mut config = load(&args.config)?;
    if let Some(host) = args.server {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let session = config.into_session().context("invalid configuration")?;

    info!("phaze-client starting");
    let manager = ConnectionManager::new();
    manager.connect(session).await.context("failed to connect")?;

    let report_every = Duration::from_secs(args.status_interval.max(1));
    let mut last_report = Instant::now();
    let mut poll = tokio::time::interval(STATE_POLL);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Interrupted, shutting down");
                break;
            }
            _ = poll.tick() => {
                if let ConnectionState::Failed(reason) = manager.status() {
                    manager.disconnect().await;
                    bail!("connection failed: {}", reason);
                }
                if last_report.elapsed() >= report_every {
                    last_report = Instant::now();
                    info!(
                        status = %manager.status_report().to_json(),
                        stats = %manager.stats_report().to_json(),
                        "{}",
                        manager.stats().format()
                    );
                }
            }
        }
    }

    manager.disconnect().await;
    info!("phaze-client shut down");
    Ok(())
}

fn check(path: PathBuf) -> Result<()> {
    let session = load(&path)?.into_session().context("invalid configuration")?;
    let options = session.options();

    println!("server:          {}", session.endpoint());
    println!("interface:       {} ({})", options.interface_name, session.cidr());
    println!("mtu:             {}", session.mtu());
    println!("default route:   {}", options.default_route);
    println!("handshake:       {:?}", options.handshake_timeout);
    println!("keepalive:       {:?}", options.keepalive_interval);
    println!("idle timeout:    {:?}", options.idle_timeout);
    println!("replay window:   {}", options.replay_window);
    println!(
        "reconnect:       {:?} x{} up to {:?}, {}",
        options.reconnect.base_delay,
        options.reconnect.factor,
        options.reconnect.max_delay,
        options
            .reconnect
            .max_attempts
            .map(|n| format!("{} attempts", n))
            .unwrap_or_else(|| "unlimited".to_string())
    );
    Ok(())
}
