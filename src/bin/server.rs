//! Shroud Server
//!
//! Accepts tunnels from clients, authenticates them and makes the
//! outbound connections their streams ask for.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use shroud::config::{generate_example_config, Config};
use shroud::server::{Server, TcpDialer};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shroud Server - tunnel relay
#[derive(Parser, Debug)]
#[command(name = "shroud-server")]
#[command(about = "Shroud Server - encrypted, multiplexed tunneling relay")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = generate_example_config()
            .to_toml()
            .context("Failed to render example configuration")?;
        print!("{}", example);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    config
        .logging
        .init(args.log_level.as_deref())
        .context("Failed to initialize logging")?;

    let server_config = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    if config.security.secret.is_empty() {
        warn!("security.secret is empty; any client with the same setting can connect");
    }
    let provider = config
        .security
        .provider()
        .context("Invalid security configuration")?;

    let listen_addr = args.listen.unwrap_or(server_config.listen.clone());

    info!("Shroud Server v{}", shroud::VERSION);
    info!("Security: {:?}", provider);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", listen_addr))?;

    let server = Server::new(
        provider,
        config.tunnel.tunnel_config(),
        Arc::new(TcpDialer::new(server_config.connect_timeout())),
        server_config.max_connections,
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
        }
        signal.cancel();
    });

    server
        .run(listener, shutdown)
        .await
        .context("Relay stopped")?;
    Ok(())
}
