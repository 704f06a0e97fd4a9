//! A single authenticated tunnel connection
//!
//! Owns the physical byte stream and everything scoped to it:
//! - serialized writes (one in-flight block at a time)
//! - idle-timeout race on every read and write
//! - the registry of logical streams carried by the tunnel
//! - the disconnect backlog, flushed as one DISCONNECT block per tick
//! - self-close once no streams have been carried for a while

use super::block::{Block, BlockType, StreamId, HEADER_SIZE};
use super::stream::StreamSession;
use super::{StreamError, TunnelError};
use crate::crypto::{CryptoError, Cryptor};
use crate::protocol::{
    DISCONNECT_BATCH, DISCONNECT_INTERVAL, HANDSHAKE_TIMEOUT, IDLE_CLOSE, IDLE_TIMEOUT,
};
use bytes::Bytes;
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Tunnel identifier; `0` means "not assigned yet"
pub type TunnelId = u128;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which end of the tunnel this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Proxy front-end; opens tunnels and streams
    Accepting,
    /// Terminates tunnels and dials outbound connections
    Relay,
}

/// Tunnel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    HandShaking,
    FastConnecting,
    Active,
    Closed,
}

/// Timing knobs for a tunnel
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Maximum wait for a read or write before the tunnel is force-closed
    pub idle_timeout: Duration,
    /// Upper bound for the whole handshake
    pub handshake_timeout: Duration,
    /// Self-close delay once no streams are registered and nothing is queued
    pub idle_close: Duration,
    /// Disconnect batch flush period
    pub disconnect_interval: Duration,
    /// Maximum stream ids per DISCONNECT block
    pub disconnect_batch: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_close: IDLE_CLOSE,
            disconnect_interval: DISCONNECT_INTERVAL,
            disconnect_batch: DISCONNECT_BATCH,
        }
    }
}

/// Mint a fresh non-zero tunnel id
pub(crate) fn mint_tunnel_id() -> TunnelId {
    loop {
        let id: TunnelId = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// One physical, encrypted, multiplexed connection
pub struct Tunnel {
    id: Mutex<TunnelId>,
    role: Role,
    config: TunnelConfig,
    state: Mutex<TunnelState>,
    reader: tokio::sync::Mutex<BoxedReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    cryptor: OnceLock<Box<dyn Cryptor>>,
    /// Only this tunnel inserts or removes its own streams
    streams: DashMap<StreamId, Arc<StreamSession>>,
    disconnects: SegQueue<StreamId>,
    control_sequence: AtomicU32,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Tunnel {
    /// Wrap an already connected byte stream
    pub fn from_stream<S>(role: Role, stream: S, config: TunnelConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::new(role, Box::new(read_half), Box::new(write_half), config)
    }

    /// Build a tunnel from separate read/write halves
    pub fn new(
        role: Role,
        reader: BoxedReader,
        writer: BoxedWriter,
        config: TunnelConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Mutex::new(0),
            role,
            config,
            state: Mutex::new(TunnelState::Created),
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            cryptor: OnceLock::new(),
            streams: DashMap::new(),
            disconnects: SegQueue::new(),
            control_sequence: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            timers: Mutex::new(Vec::new()),
        })
    }

    /// Id agreed during the handshake; `0` until then
    pub fn id(&self) -> TunnelId {
        *lock(&self.id)
    }

    pub(crate) fn set_id(&self, id: TunnelId) {
        *lock(&self.id) = id;
    }

    /// Which end of the tunnel this is
    pub fn role(&self) -> Role {
        self.role
    }

    /// Timers this tunnel runs with
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        *lock(&self.state)
    }

    /// Whether the tunnel was disposed
    pub fn is_closed(&self) -> bool {
        self.state() == TunnelState::Closed
    }

    /// Whether the handshake installed a cryptor
    pub fn is_initialized(&self) -> bool {
        self.cryptor.get().is_some()
    }

    /// Resolves once the tunnel is disposed
    pub fn closed(&self) -> impl Future<Output = ()> + Send + '_ {
        self.cancel.cancelled()
    }

    /// Move out of `Created` into one of the handshake states
    pub(crate) fn begin_handshake(&self, next: TunnelState) -> Result<(), TunnelError> {
        let mut state = lock(&self.state);
        if *state != TunnelState::Created {
            return Err(TunnelError::Handshake(format!(
                "cannot start handshake from {:?}",
                *state
            )));
        }
        *state = next;
        Ok(())
    }

    /// Install the negotiated cryptor and start the background timers
    pub(crate) fn activate(self: &Arc<Self>, cryptor: Box<dyn Cryptor>) -> Result<(), TunnelError> {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, TunnelState::HandShaking | TunnelState::FastConnecting) {
                return Err(TunnelError::Handshake(format!(
                    "cannot activate from {:?}",
                    *state
                )));
            }
            if self.cryptor.set(cryptor).is_err() {
                return Err(TunnelError::Handshake("tunnel already initialized".to_string()));
            }
            *state = TunnelState::Active;
        }

        let flush = tokio::spawn(flush_loop(
            Arc::downgrade(self),
            self.config.disconnect_interval,
            self.cancel.clone(),
        ));
        let idle = tokio::spawn(idle_loop(
            Arc::downgrade(self),
            self.config.idle_close,
            self.cancel.clone(),
        ));
        lock(&self.timers).extend([flush, idle]);

        info!("Tunnel {} active ({:?})", self, self.role);
        Ok(())
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Race `op` against disposal and the idle timeout
    ///
    /// The operation future is kept alive across idle checks, so a read that
    /// is merely slow to start is never cancelled halfway through a block.
    async fn race<T, F>(&self, op: F) -> Result<T, TunnelError>
    where
        F: Future<Output = Result<T, TunnelError>>,
    {
        tokio::pin!(op);
        loop {
            let deadline = self.last_activity() + self.config.idle_timeout;
            tokio::select! {
                result = &mut op => {
                    if result.is_ok() {
                        self.touch();
                    }
                    return result;
                }
                _ = self.cancel.cancelled() => return Err(TunnelError::Closed),
                _ = tokio::time::sleep_until(deadline) => {
                    if self.last_activity() + self.config.idle_timeout <= Instant::now() {
                        warn!("Tunnel {} idle for {:?}, closing", self, self.config.idle_timeout);
                        self.dispose("idle timeout");
                        return Err(TunnelError::Timeout);
                    }
                }
            }
        }
    }

    /// Read the next block off the wire
    ///
    /// Header corruption is fatal and disposes the tunnel. A payload that
    /// fails its checksum comes back as an `Invalid` block.
    pub async fn read_block(&self) -> Result<Block, TunnelError> {
        let result = self
            .race(async {
                let mut reader = self.reader.lock().await;

                let mut header = [0u8; HEADER_SIZE];
                reader.read_exact(&mut header).await?;
                let mut block = Block::decode_header(&header)?;

                let mut payload = vec![0u8; block.length as usize];
                reader.read_exact(&mut payload).await?;
                block.payload = Bytes::from(payload);

                Ok(block)
            })
            .await;

        match result {
            Ok(mut block) => {
                if !block.verify_body() {
                    warn!(
                        "Tunnel {}: body checksum mismatch on {:?} for stream {:032x}",
                        self, block.block_type, block.stream_id
                    );
                    block.mark_invalid();
                }
                trace!(
                    "Tunnel {} read {:?} stream={:032x} seq={} len={}",
                    self,
                    block.block_type,
                    block.stream_id,
                    block.sequence,
                    block.length
                );
                Ok(block)
            }
            Err(TunnelError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Tunnel {}: peer closed the connection", self);
                self.dispose("peer closed");
                Err(TunnelError::Closed)
            }
            Err(e) => {
                if e.is_tunnel_fatal() && !matches!(e, TunnelError::Closed | TunnelError::Timeout) {
                    warn!("Tunnel {} read failed: {}", self, e);
                    self.dispose("read failure");
                }
                Err(e)
            }
        }
    }

    /// Write one block; concurrent callers queue behind the write lock
    pub async fn write_block(&self, block: &Block) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let header = block.encode_header()?;

        let result = self
            .race(async {
                let mut writer = self.writer.lock().await;
                writer.write_all(&header).await?;
                writer.write_all(&block.payload).await?;
                writer.flush().await?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                trace!(
                    "Tunnel {} wrote {:?} stream={:032x} seq={} len={}",
                    self,
                    block.block_type,
                    block.stream_id,
                    block.sequence,
                    block.length
                );
                Ok(())
            }
            Err(TunnelError::Io(e)) => {
                debug!("Tunnel {} write failed: {}", self, e);
                self.dispose("write failure");
                Err(TunnelError::Io(e))
            }
            Err(e) => Err(e),
        }
    }

    fn cryptor(&self) -> Result<&dyn Cryptor, TunnelError> {
        self.cryptor
            .get()
            .map(|c| c.as_ref())
            .ok_or(TunnelError::Crypto(CryptoError::NotInitialized))
    }

    /// Encrypt a block's payload for the wire
    pub fn encrypt_block(&self, mut block: Block) -> Result<Block, TunnelError> {
        if block.payload.is_empty() {
            return Ok(block);
        }
        let ciphertext = self.cryptor()?.encrypt(&block.payload)?;
        block.set_payload(Bytes::from(ciphertext));
        Ok(block)
    }

    /// Decrypt a received block's payload; failures mark the block invalid
    pub fn decrypt_block(&self, mut block: Block) -> Block {
        if block.is_invalid() || block.payload.is_empty() {
            return block;
        }

        let result = self
            .cryptor()
            .and_then(|c| c.decrypt(&block.payload).map_err(TunnelError::from));
        match result {
            Ok(plaintext) => block.set_payload(Bytes::from(plaintext)),
            Err(e) => {
                warn!(
                    "Tunnel {}: cannot decrypt {:?} for stream {:032x}: {}",
                    self, block.block_type, block.stream_id, e
                );
                block.mark_invalid();
            }
        }
        block
    }

    /// Encrypt and write
    pub async fn send_block(&self, block: Block) -> Result<(), TunnelError> {
        let block = self.encrypt_block(block)?;
        self.write_block(&block).await
    }

    /// Next sequence number for blocks on the control stream
    pub fn next_control_sequence(&self) -> u32 {
        self.control_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a stream to the registry
    pub fn register_stream(&self, session: Arc<StreamSession>) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed(session.id()));
        }
        trace!("Tunnel {} registers stream {:032x}", self, session.id());
        self.streams.insert(session.id(), session);
        Ok(())
    }

    /// Remove a stream from the registry without disposing it
    pub fn unregister_stream(&self, stream_id: StreamId) -> Option<Arc<StreamSession>> {
        self.streams.remove(&stream_id).map(|(_, session)| session)
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<Arc<StreamSession>> {
        self.streams.get(&stream_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Queue a stream id for the next DISCONNECT batch
    pub fn queue_disconnect(&self, stream_id: StreamId) {
        self.disconnects.push(stream_id);
    }

    pub fn pending_disconnects(&self) -> usize {
        self.disconnects.len()
    }

    /// Tear a stream down locally; the peer hears about it on the next flush
    pub fn close_stream(&self, stream_id: StreamId, notify_peer: bool) {
        if let Some(session) = self.unregister_stream(stream_id) {
            debug!("Tunnel {} closes stream {:032x}", self, stream_id);
            session.dispose();
            if notify_peer && !self.is_closed() {
                self.queue_disconnect(stream_id);
            }
        }
    }

    /// Send up to one batch of queued disconnects; returns how many ids went out
    pub async fn flush_disconnects(&self) -> Result<usize, TunnelError> {
        let mut ids = Vec::new();
        while ids.len() < self.config.disconnect_batch {
            match self.disconnects.pop() {
                Some(id) => ids.push(id),
                None => break,
            }
        }

        if ids.is_empty() {
            return Ok(0);
        }

        debug!("Tunnel {} flushes {} disconnect(s)", self, ids.len());
        let block = Block::disconnect(&ids).with_sequence(self.next_control_sequence());
        self.send_block(block).await?;
        Ok(ids.len())
    }

    /// Close the tunnel: cancel its loops and dispose every stream it carries
    pub fn dispose(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if *state == TunnelState::Closed {
                return;
            }
            *state = TunnelState::Closed;
        }

        info!("Tunnel {} closed: {}", self, reason);
        self.cancel.cancel();

        for timer in lock(&self.timers).drain(..) {
            timer.abort();
        }

        let ids: Vec<StreamId> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(session) = self.unregister_stream(id) {
                session.dispose();
            }
        }

        while self.disconnects.pop().is_some() {}
    }

    /// Dispose and shut the physical connection down
    pub async fn shutdown(&self) {
        self.dispose("shutdown");
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!("Tunnel {} writer shutdown: {}", self, e);
        }
    }

    pub(crate) fn expect_type(&self, block: &Block, expected: BlockType) -> Result<(), TunnelError> {
        if block.block_type == expected {
            Ok(())
        } else {
            Err(TunnelError::Handshake(format!(
                "expected {:?}, got {:?}",
                expected, block.block_type
            )))
        }
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines
        write!(f, "{:08x}", (self.id() >> 96) as u32)
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &format_args!("{:032x}", self.id()))
            .field("role", &self.role)
            .field("state", &self.state())
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut timers) = self.timers.lock() {
            for timer in timers.drain(..) {
                timer.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Periodically send queued disconnects
async fn flush_loop(tunnel: Weak<Tunnel>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(tunnel) = tunnel.upgrade() else { break };
        if let Err(e) = tunnel.flush_disconnects().await {
            debug!("Tunnel {} disconnect flush stopped: {}", tunnel, e);
            break;
        }
    }
}

/// Close the tunnel once it has carried nothing for `idle_close`
async fn idle_loop(tunnel: Weak<Tunnel>, idle_close: Duration, cancel: CancellationToken) {
    let check = (idle_close / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut ticker = tokio::time::interval(check);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut empty_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(tunnel) = tunnel.upgrade() else { break };

        if tunnel.stream_count() == 0 && tunnel.pending_disconnects() == 0 {
            let since = *empty_since.get_or_insert_with(Instant::now);
            let quiet_since = since.max(tunnel.last_activity());
            if quiet_since.elapsed() >= idle_close {
                tunnel.dispose("idle with no streams");
                break;
            }
        } else {
            empty_since = None;
        }
    }
}
