//! Protocol definitions and constants

mod address;

pub use address::Address;

use std::time::Duration;
use thiserror::Error;

/// Protocol errors
///
/// Every variant is fatal to the tunnel it was raised on: once a header fails
/// to parse the byte stream can no longer be trusted to be frame-aligned.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Header checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    HeaderChecksum { expected: u32, actual: u32 },

    #[error("Invalid block type: {0:#04x}")]
    InvalidBlockType(u8),

    #[error("Declared length {declared} does not match payload length {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Maximum payload carried by a single block (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// Maximum plaintext read from a logical stream into one DATA block
pub const MAX_DATA_CHUNK: usize = 32 * 1024;

/// Default upper bound for a single read or write before the tunnel is considered dead
#[cfg(debug_assertions)]
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound for a single read or write before the tunnel is considered dead
#[cfg(not(debug_assertions))]
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Handshake timeout
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a tunnel without streams lingers before closing itself
pub const IDLE_CLOSE: Duration = Duration::from_secs(60);

/// Disconnect batch flush period
pub const DISCONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum stream ids sent in one DISCONNECT block
pub const DISCONNECT_BATCH: usize = 512;

/// Inbound blocks a single stream may have queued before the receive loop waits for it
pub const MAX_PENDING_BLOCKS: usize = 256;
