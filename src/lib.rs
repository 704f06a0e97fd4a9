//! # Shroud
//!
//! An encrypted, multiplexed tunneling proxy.
//!
//! A local SOCKS5/HTTP proxy accepts client connections and carries them,
//! encrypted and multiplexed, over a few long-lived TCP tunnels to a relay,
//! which makes the real outbound connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Proxy Front-ends                   │
//! │                  (SOCKS5, HTTP proxy)                │
//! ├─────────────────────────────────────────────────────┤
//! │                     Tunnel Pool                      │
//! │          (create up to a cap, reuse at random)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │      (logical streams, in-order per-stream chains,   │
//! │              batched disconnects)                    │
//! ├─────────────────────────────────────────────────────┤
//! │                    Tunnel Layer                      │
//! │   (handshake, encryption, block codec with CRC32)    │
//! ├─────────────────────────────────────────────────────┤
//! │                    TCP Transport                     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod tunnel;

pub use client::Client;
pub use config::Config;
pub use server::Server;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Stream error: {0}")]
    Stream(#[from] tunnel::StreamError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
