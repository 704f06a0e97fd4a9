//! Per-tunnel receive loop
//!
//! Reads blocks off an active tunnel and routes them:
//! - `DISCONNECT` tears down every listed stream locally
//! - `CONNECT` (relay only) dials the target and answers `CONNECTED` or `CONNECT_FAILED`
//! - everything else is queued on the target stream's processing chain, so
//!   blocks of one stream are applied in arrival order while different
//!   streams proceed concurrently
//!
//! Blocks for unknown streams are dropped; the stream already closed locally.
//! A `DISCONNECT` that arrives while the relay is still dialing cancels the
//! dial, and the outbound connection is dropped instead of registered.

use super::block::{Block, BlockType, StreamId};
use super::connection::Tunnel;
use super::stream::{LogicalStream, StreamSession};
use super::TunnelError;
use crate::protocol::Address;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Opens outbound connections for `CONNECT` requests (relay side)
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &Address) -> io::Result<Arc<dyn LogicalStream>>;
}

/// Receive loop for one tunnel
pub struct Multiplexer {
    tunnel: Arc<Tunnel>,
    dialer: Option<Arc<dyn Dialer>>,
    connects: JoinSet<()>,
    /// Streams whose `CONNECT` is still being dialed
    pending: Arc<DashMap<StreamId, CancellationToken>>,
}

impl Multiplexer {
    /// `dialer` is only needed on the relay side
    pub fn new(tunnel: Arc<Tunnel>, dialer: Option<Arc<dyn Dialer>>) -> Self {
        Self {
            tunnel,
            dialer,
            connects: JoinSet::new(),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Run until the tunnel fails or is disposed
    ///
    /// Returns `Ok(())` when the tunnel closed normally. On every exit path
    /// the tunnel is shut down, which disposes all of its streams.
    pub async fn run(mut self) -> Result<(), TunnelError> {
        let result = loop {
            let block = match self.tunnel.read_block().await {
                Ok(block) => block,
                Err(e) => break e,
            };
            let block = self.tunnel.decrypt_block(block);
            self.dispatch(block).await;

            // Reap finished dial tasks
            while self.connects.try_join_next().is_some() {}
        };

        self.connects.shutdown().await;
        self.tunnel.shutdown().await;

        match result {
            TunnelError::Closed => {
                debug!("Tunnel {} receive loop finished", self.tunnel);
                Ok(())
            }
            e => {
                info!("Tunnel {} receive loop failed: {}", self.tunnel, e);
                Err(e)
            }
        }
    }

    async fn dispatch(&mut self, block: Block) {
        match block.block_type {
            BlockType::Disconnect => self.handle_disconnect(&block),
            BlockType::Connect => self.handle_connect(block),
            BlockType::Data
            | BlockType::Connected
            | BlockType::ConnectFailed
            | BlockType::Invalid => self.route(block).await,
            BlockType::HandShake | BlockType::HandShakeResponse | BlockType::FastConnect => {
                warn!(
                    "Tunnel {}: ignoring {:?} on an active tunnel",
                    self.tunnel, block.block_type
                );
            }
        }
    }

    fn handle_disconnect(&self, block: &Block) {
        match block.disconnect_ids() {
            Ok(ids) => {
                debug!("Tunnel {}: peer closed {} stream(s)", self.tunnel, ids.len());
                for id in ids {
                    // Waits out a dial task that is registering this id right now
                    if let Some((_, cancel)) = self.pending.remove(&id) {
                        debug!("Tunnel {}: cancelling connect for {:032x}", self.tunnel, id);
                        cancel.cancel();
                    }
                    self.tunnel.close_stream(id, false);
                }
            }
            Err(e) => warn!("Tunnel {}: bad disconnect block: {}", self.tunnel, e),
        }
    }

    async fn route(&self, block: Block) {
        let Some(session) = self.tunnel.stream(block.stream_id) else {
            trace!(
                "Tunnel {}: dropping {:?} for unknown stream {:032x}",
                self.tunnel,
                block.block_type,
                block.stream_id
            );
            return;
        };

        // Waits here while the stream is saturated
        let Some(permit) = session.reserve().await else {
            return;
        };
        session.enqueue(block, Some(permit));
    }

    fn handle_connect(&mut self, block: Block) {
        let Some(dialer) = self.dialer.clone() else {
            warn!(
                "Tunnel {}: CONNECT for {:032x} on the accepting side",
                self.tunnel, block.stream_id
            );
            return;
        };

        let stream_id = block.stream_id;
        if block.is_invalid()
            || self.tunnel.contains_stream(stream_id)
            || self.pending.contains_key(&stream_id)
        {
            warn!(
                "Tunnel {}: refusing CONNECT for stream {:032x}",
                self.tunnel, stream_id
            );
            return;
        }

        let cancel = CancellationToken::new();
        self.pending.insert(stream_id, cancel.clone());

        let tunnel = Arc::clone(&self.tunnel);
        let pending = Arc::clone(&self.pending);
        self.connects.spawn(async move {
            match Address::decode(&block.payload) {
                Ok(target) => {
                    let connect = PendingConnect {
                        stream_id,
                        pending: &pending,
                        cancel,
                    };
                    open_stream(tunnel, dialer, connect, target).await;
                }
                Err(e) => {
                    warn!("Tunnel {}: bad CONNECT request: {}", tunnel, e);
                    reply_failed(&tunnel, stream_id).await;
                }
            }
            pending.remove_if(&stream_id, |_, token| !token.is_cancelled());
        });
    }
}

/// An in-flight `CONNECT` and the entry that lets a `DISCONNECT` cancel it
struct PendingConnect<'a> {
    stream_id: StreamId,
    pending: &'a DashMap<StreamId, CancellationToken>,
    cancel: CancellationToken,
}

/// Dial `target` and, on success, register and start pumping the new stream
async fn open_stream(
    tunnel: Arc<Tunnel>,
    dialer: Arc<dyn Dialer>,
    connect: PendingConnect<'_>,
    target: Address,
) {
    let stream_id = connect.stream_id;
    debug!("Tunnel {}: connecting {:032x} to {}", tunnel, stream_id, target);

    let dial = tokio::time::timeout(tunnel.config().handshake_timeout, dialer.dial(&target));
    let dialed = tokio::select! {
        _ = connect.cancel.cancelled() => {
            debug!("Tunnel {}: {:032x} closed while dialing {}", tunnel, stream_id, target);
            return;
        }
        dialed = dial => dialed,
    };
    let io = match dialed {
        Ok(Ok(io)) => io,
        Ok(Err(e)) => {
            info!("Tunnel {}: connect to {} failed: {}", tunnel, target, e);
            reply_failed(&tunnel, stream_id).await;
            return;
        }
        Err(_) => {
            info!("Tunnel {}: connect to {} timed out", tunnel, target);
            reply_failed(&tunnel, stream_id).await;
            return;
        }
    };

    let session = StreamSession::new(stream_id, io, &tunnel);
    session.mark_received();

    // Registered while holding the pending entry, so a DISCONNECT either
    // finds the registered stream or has already cancelled this one
    let registered = match connect.pending.get(&stream_id) {
        Some(entry) if !entry.is_cancelled() => tunnel.register_stream(Arc::clone(&session)).is_ok(),
        _ => false,
    };
    if !registered {
        debug!("Tunnel {}: dropping connection for closed stream {:032x}", tunnel, stream_id);
        session.dispose();
        return;
    }

    match session.send(BlockType::Connected, Bytes::new()).await {
        Ok(()) => session.start_pump(Bytes::new()),
        Err(e) => {
            debug!("Tunnel {}: cannot confirm {:032x}: {}", tunnel, stream_id, e);
            tunnel.close_stream(stream_id, false);
        }
    }
}

async fn reply_failed(tunnel: &Tunnel, stream_id: StreamId) {
    if let Err(e) = tunnel.send_block(Block::connect_failed(stream_id)).await {
        debug!("Tunnel {}: cannot send CONNECT_FAILED: {}", tunnel, e);
    }
}
