//! Proxy front-ends
//!
//! Provides:
//! - SOCKS5 proxy server
//! - HTTP proxy server (CONNECT and plain absolute-URI requests)
//!
//! Both only negotiate: they parse the request and hand a [`ProxyRequest`]
//! to the caller. The success or failure reply is written later, once the
//! tunnel knows whether the target could be reached.

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "http-proxy")]
mod http;

#[cfg(feature = "socks5")]
pub use socks5::Socks5Server;

#[cfg(feature = "http-proxy")]
pub use http::HttpProxyServer;

pub use crate::protocol::Address;

use crate::tunnel::ConnectReplies;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Username/password accepted by a proxy front-end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A negotiated proxy request, waiting for its stream to be opened
pub struct ProxyRequest<S> {
    /// Client connection, positioned after the proxy negotiation
    pub stream: S,
    /// Where the client wants to go
    pub target: Address,
    /// Replies to write once the connect outcome is known
    pub replies: Arc<ConnectReplies>,
    /// Client bytes already consumed during negotiation that belong to the target
    pub initial_data: Bytes,
}

impl<S> std::fmt::Debug for ProxyRequest<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRequest")
            .field("target", &self.target)
            .field("initial_data", &self.initial_data.len())
            .finish()
    }
}
