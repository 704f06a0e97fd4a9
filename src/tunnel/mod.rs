//! Tunnel layer - encrypted, multiplexed communication channel
//!
//! Provides:
//! - Block encoding/decoding with header and body checksums
//! - Authentication handshake (standard and fast-connect)
//! - Stream multiplexing with in-order per-stream processing
//! - Tunnel pooling under a concurrency cap

mod block;
mod connection;
mod handshake;
mod multiplexer;
mod pool;
mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use block::{Block, BlockType, StreamId, BODY_CHECKSUM_OFFSET, HEADER_CHECKSUM_OFFSET, HEADER_SIZE};
pub use connection::{Role, Tunnel, TunnelConfig, TunnelId, TunnelState};
pub use handshake::{
    accept_handshake, connect_handshake, fast_connect, Accepted, FastConnectOutcome,
};
pub use multiplexer::{Dialer, Multiplexer};
pub use pool::{pick_random, Acquired, TunnelPool};
pub use stream::{ConnectReplies, IoStream, LogicalStream, StreamSession};

use crate::crypto::CryptoError;
use crate::protocol::ProtocolError;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication failed: {0}")]
    Authentication(CryptoError),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Tunnel idle timeout")]
    Timeout,

    #[error("Tunnel closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for TunnelError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => TunnelError::Authentication(err),
            other => TunnelError::Crypto(other),
        }
    }
}

impl TunnelError {
    /// Whether the error leaves the tunnel unusable
    pub fn is_tunnel_fatal(&self) -> bool {
        !matches!(self, TunnelError::Stream(_))
    }
}

/// Errors scoped to a single logical stream; the tunnel survives them
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connect to {0} failed")]
    ConnectFailed(String),

    #[error("Connect timed out")]
    ConnectTimeout,

    #[error("Stream {0:032x} closed")]
    Closed(StreamId),

    #[error("Invalid block for stream {0:032x}")]
    InvalidBlock(StreamId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
