//! wsvless CLI entry point.
//!
//! Two long-running subcommands share one binary: `run` (the default) is
//! the node/server endpoint, `client` is the local SOCKS5 front-end. An
//! `install` subcommand renders a systemd unit for whichever mode was asked
//! for, mirroring the original's shell-script install path.

// Use mimalloc as global allocator for better p99 latency.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use wsvless::client::ClientConfig;
use wsvless::{Config, VERSION};

#[derive(Parser, Debug)]
#[command(name = "wsvless")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "VLESS-over-WebSocket proxy: node and client endpoints")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the node's TOML configuration file (§6).
    #[arg(short = 'c', long = "config", default_value = "config.toml", global = true)]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node (server) endpoint. Default when no subcommand is given.
    Run,
    /// Run the client's local SOCKS5 listener, tunneling through a node.
    Client {
        /// Local SOCKS5 listen address.
        #[arg(long, default_value = "127.0.0.1:1088")]
        listen: String,
        /// Node WebSocket URL, e.g. `wss://node.example.com/wsv/<uuid>?ed=2560`.
        #[arg(long)]
        node_url: String,
        /// VLESS UUID to authenticate with.
        #[arg(long)]
        uuid: Uuid,
        /// GeoIP country database used for the direct-vs-tunnel decision.
        #[arg(long, default_value = "GeoLite2-Country.mmdb")]
        geoip_db: String,
    },
    /// Write a systemd unit file for this binary and exit.
    Install {
        /// Which mode the generated unit should launch.
        #[arg(long, default_value = "run")]
        mode: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Install aws-lc-rs as the default crypto provider for rustls.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        .event_interval(61)
        .global_queue_interval(31)
        .thread_name("wsvless-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wsvless=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("wsvless v{}", VERSION);

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            shutdown_signal.cancel();
        }
    });

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = match Config::load(args.config.to_str().unwrap_or("config.toml")) {
                Ok(c) => c,
                Err(e) => {
                    error!("failed to load configuration: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = wsvless::node::run(std::sync::Arc::new(config), shutdown).await {
                error!("node error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Client {
            listen,
            node_url,
            uuid,
            geoip_db,
        } => {
            let config = ClientConfig {
                listen,
                node_url,
                uuid,
                geoip_db,
            };
            if let Err(e) = wsvless::client::run(config, shutdown).await {
                error!("client error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Install { mode } => {
            install_systemd_unit(&mode)?;
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn install_systemd_unit(mode: &str) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let unit = format!(
        "[Unit]\nDescription=wsvless ({mode})\nAfter=network.target\n\n[Service]\nExecStart={} {mode}\nRestart=on-failure\nUser=nobody\n\n[Install]\nWantedBy=multi-user.target\n",
        exe.display()
    );
    let path = format!("/etc/systemd/system/wsvless-{mode}.service");
    std::fs::write(&path, unit)?;
    info!("wrote systemd unit to {}", path);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn install_systemd_unit(_mode: &str) -> anyhow::Result<()> {
    anyhow::bail!("systemd unit install is only supported on Linux")
}
