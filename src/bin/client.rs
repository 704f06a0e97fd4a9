//! Shroud Client
//!
//! Runs the local SOCKS5 and HTTP proxies and carries every accepted
//! connection as a logical stream over a small pool of tunnels.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use shroud::client::{Client, ClientOptions};
use shroud::config::{generate_example_config, Config};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shroud Client - local proxy front-end
#[derive(Parser, Debug)]
#[command(name = "shroud-client")]
#[command(about = "Shroud Client - encrypted, multiplexed tunneling proxy")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Relay address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local SOCKS5 proxy address (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// Local HTTP proxy address (overrides config)
    #[arg(long)]
    http: Option<String>,

    /// Maximum concurrent tunnels (overrides config)
    #[arg(long)]
    max_tunnels: Option<usize>,

    /// Disable fast connect
    #[arg(long)]
    no_fast_connect: bool,

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

    let mut client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    if let Some(server) = args.server {
        client_config.server = server;
    }
    if let Some(socks5) = args.socks5 {
        client_config.socks5_listen = Some(socks5);
    }
    if let Some(http) = args.http {
        client_config.http_listen = Some(http);
    }
    if let Some(max_tunnels) = args.max_tunnels {
        client_config.max_tunnels = max_tunnels;
    }
    if args.no_fast_connect {
        client_config.fast_connect = false;
    }

    if config.security.secret.is_empty() {
        warn!("security.secret is empty; the relay must be configured the same way");
    }
    let provider = config
        .security
        .provider()
        .context("Invalid security configuration")?;

    info!("Shroud Client v{}", shroud::VERSION);
    info!("Relay: {}", client_config.server);

    let client = Client::new(
        ClientOptions {
            server: client_config.server.clone(),
            max_tunnels: client_config.max_tunnels,
            fast_connect: client_config.fast_connect,
            tunnel: config.tunnel.tunnel_config(),
        },
        provider,
    );
    let credentials = client_config.proxy_credentials();

    let mut proxies = tokio::task::JoinSet::new();

    #[cfg(feature = "socks5")]
    if let Some(addr) = &client_config.socks5_listen {
        let mut server = shroud::proxy::Socks5Server::bind(addr)
            .await
            .context("Failed to start SOCKS5 proxy")?;
        if let Some(credentials) = credentials.clone() {
            server = server.with_auth(credentials);
        }
        let client = Arc::clone(&client);
        proxies.spawn(async move {
            let result = server
                .run(move |request| Arc::clone(&client).handle_request(request))
                .await;
            if let Err(e) = result {
                error!("SOCKS5 proxy stopped: {}", e);
            }
        });
    }

    #[cfg(feature = "http-proxy")]
    if let Some(addr) = &client_config.http_listen {
        let mut server = shroud::proxy::HttpProxyServer::bind(addr)
            .await
            .context("Failed to start HTTP proxy")?;
        if let Some(credentials) = credentials.clone() {
            server = server.with_auth(credentials);
        }
        let client = Arc::clone(&client);
        proxies.spawn(async move {
            let result = server
                .run(move |request| Arc::clone(&client).handle_request(request))
                .await;
            if let Err(e) = result {
                error!("HTTP proxy stopped: {}", e);
            }
        });
    }

    if proxies.is_empty() {
        return Err(anyhow!("No proxy listener configured"));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
        _ = proxies.join_next() => warn!("A proxy listener exited"),
    }

    proxies.abort_all();
    client.shutdown();
    Ok(())
}
