//! Logical streams carried inside a tunnel
//!
//! A [`StreamSession`] glues one application-side connection (anything
//! implementing [`LogicalStream`]) to the tunnel that carries it:
//! - inbound blocks are processed strictly one after another, in arrival order
//! - outbound data is pumped from the application connection as DATA blocks
//! - the proxy reply (SOCKS5 / HTTP) is written while CONNECTED or
//!   CONNECT_FAILED is processed, so it always precedes forwarded data

use super::block::{Block, BlockType, StreamId};
use super::connection::Tunnel;
use super::TunnelError;
use crate::protocol::{MAX_DATA_CHUNK, MAX_PENDING_BLOCKS};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Application-side end of a logical stream
#[async_trait]
pub trait LogicalStream: Send + Sync {
    /// Process-local id, for logs only
    fn local_id(&self) -> u64;

    /// Read whatever is available; `Ok(0)` means end of stream
    async fn read_some(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_all(&self, data: &[u8]) -> io::Result<()>;

    async fn flush(&self) -> io::Result<()>;

    /// Half-close the write side
    async fn shutdown(&self);

    /// The stream was torn down; pending and future I/O must fail fast
    fn on_disconnect(&self);
}

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// [`LogicalStream`] over any tokio byte stream
pub struct IoStream<S> {
    local_id: u64,
    reader: tokio::sync::Mutex<ReadHalf<S>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    closed: CancellationToken,
}

impl<S> IoStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        Arc::new(Self {
            local_id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            closed: CancellationToken::new(),
        })
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "stream disconnected")
}

#[async_trait]
impl<S> LogicalStream for IoStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn local_id(&self) -> u64 {
        self.local_id
    }

    async fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(disconnected()),
            result = reader.read(buf) => result,
        }
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(disconnected()),
            result = writer.write_all(data) => result,
        }
    }

    async fn flush(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(disconnected()),
            result = writer.flush() => result,
        }
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Stream (local {}): shutdown failed: {}", self.local_id, e);
        }
    }

    fn on_disconnect(&self) {
        self.closed.cancel();
    }
}

/// Proxy replies for a stream that is waiting on CONNECT; written at most once
#[derive(Debug)]
pub struct ConnectReplies {
    success: Bytes,
    failure: Bytes,
    sent: AtomicBool,
}

impl ConnectReplies {
    pub fn new(success: impl Into<Bytes>, failure: impl Into<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            success: success.into(),
            failure: failure.into(),
            sent: AtomicBool::new(false),
        })
    }

    /// Nothing to reply with (streams opened directly through the API)
    pub fn none() -> Arc<Self> {
        Self::new(Bytes::new(), Bytes::new())
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// Write the success or failure reply unless one was already written
    pub async fn send(&self, io: &dyn LogicalStream, connected: bool) -> io::Result<()> {
        if self.sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let reply = if connected { &self.success } else { &self.failure };
        if reply.is_empty() {
            return Ok(());
        }
        io.write_all(reply).await?;
        io.flush().await
    }
}

/// One logical stream registered in a tunnel
pub struct StreamSession {
    id: StreamId,
    io: Arc<dyn LogicalStream>,
    tunnel: Weak<Tunnel>,
    replies: Arc<ConnectReplies>,
    connect_waiter: Mutex<Option<oneshot::Sender<bool>>>,
    /// Completion of the last block handed to this stream
    chain: Mutex<Option<JoinHandle<bool>>>,
    pending: Arc<Semaphore>,
    pump: Mutex<Option<JoinHandle<()>>>,
    send_sequence: AtomicU32,
    recv_sequence: AtomicU32,
    disposed: AtomicBool,
}

impl StreamSession {
    pub fn new(id: StreamId, io: Arc<dyn LogicalStream>, tunnel: &Arc<Tunnel>) -> Arc<Self> {
        Self::with_replies(id, io, tunnel, ConnectReplies::none())
    }

    pub fn with_replies(
        id: StreamId,
        io: Arc<dyn LogicalStream>,
        tunnel: &Arc<Tunnel>,
        replies: Arc<ConnectReplies>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            io,
            tunnel: Arc::downgrade(tunnel),
            replies,
            connect_waiter: Mutex::new(None),
            chain: Mutex::new(None),
            pending: Arc::new(Semaphore::new(MAX_PENDING_BLOCKS)),
            pump: Mutex::new(None),
            send_sequence: AtomicU32::new(0),
            recv_sequence: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    /// Session for the stream opened by FAST_CONNECT on the accepting side
    ///
    /// The request and its reply already used sequence 0 in each direction.
    pub fn fast_connected(
        id: StreamId,
        io: Arc<dyn LogicalStream>,
        tunnel: &Arc<Tunnel>,
        replies: Arc<ConnectReplies>,
    ) -> Arc<Self> {
        let session = Self::with_replies(id, io, tunnel, replies);
        session.next_sequence();
        session.mark_received();
        session
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn io(&self) -> &Arc<dyn LogicalStream> {
        &self.io
    }

    pub fn replies(&self) -> &Arc<ConnectReplies> {
        &self.replies
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Next outbound sequence number
    pub fn next_sequence(&self) -> u32 {
        self.send_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Account for an inbound block consumed outside [`StreamSession::process`]
    pub fn mark_received(&self) {
        self.recv_sequence.fetch_add(1, Ordering::Relaxed);
    }

    /// Sequence number the next inbound block should carry
    pub fn expected_sequence(&self) -> u32 {
        self.recv_sequence.load(Ordering::Relaxed)
    }

    /// Get notified when CONNECTED (`true`) or CONNECT_FAILED (`false`) arrives
    pub fn expect_connect(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.connect_waiter) = Some(tx);
        rx
    }

    /// `false` when nobody was waiting on the connect
    fn resolve_connect(&self, connected: bool) -> bool {
        match lock(&self.connect_waiter).take() {
            Some(tx) => {
                // The opener may have stopped waiting already
                let _ = tx.send(connected);
                true
            }
            None => false,
        }
    }

    /// Build a block for this stream with the next outbound sequence number
    pub fn block(&self, block_type: BlockType, payload: Bytes) -> Block {
        Block::new(self.id, block_type, payload).with_sequence(self.next_sequence())
    }

    /// Encrypt and send a block for this stream
    pub async fn send(&self, block_type: BlockType, payload: Bytes) -> Result<(), TunnelError> {
        let tunnel = self.tunnel.upgrade().ok_or(TunnelError::Closed)?;
        tunnel.send_block(self.block(block_type, payload)).await
    }

    /// Handle one inbound block; `false` means the stream must be torn down
    pub async fn process(&self, block: Block) -> bool {
        let expected = self.recv_sequence.fetch_add(1, Ordering::Relaxed);
        if block.sequence != expected {
            debug!(
                "Stream {:032x}: sequence {} received, {} expected",
                self.id, block.sequence, expected
            );
        }

        match block.block_type {
            BlockType::Data => {
                let result = match self.io.write_all(&block.payload).await {
                    Ok(()) => self.io.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    debug!("Stream {:032x}: local write failed: {}", self.id, e);
                    return false;
                }
                true
            }
            BlockType::Connected => {
                let written = self.replies.send(self.io.as_ref(), true).await;
                self.resolve_connect(written.is_ok());
                if let Err(e) = written {
                    debug!("Stream {:032x}: cannot write connect reply: {}", self.id, e);
                    return false;
                }
                true
            }
            BlockType::ConnectFailed => {
                debug!("Stream {:032x}: relay could not connect", self.id);
                if let Err(e) = self.replies.send(self.io.as_ref(), false).await {
                    debug!("Stream {:032x}: cannot write failure reply: {}", self.id, e);
                }
                self.resolve_connect(false);
                false
            }
            BlockType::Invalid => {
                warn!("Stream {:032x}: invalid block, closing stream", self.id);
                false
            }
            other => {
                debug!("Stream {:032x}: ignoring unexpected {:?}", self.id, other);
                true
            }
        }
    }

    /// Reserve room for one more in-flight block; waits while the stream is saturated
    pub(crate) async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.pending).acquire_owned().await.ok()
    }

    /// Queue `block` behind every block previously handed to this stream
    ///
    /// If an earlier block failed (or its task died) the stream is torn down
    /// and this block is dropped unprocessed.
    pub(crate) fn enqueue(self: &Arc<Self>, block: Block, permit: Option<OwnedSemaphorePermit>) {
        let mut chain = lock(&self.chain);
        let previous = chain.take();
        let session = Arc::clone(self);

        *chain = Some(tokio::spawn(async move {
            let _permit = permit;

            if let Some(previous) = previous {
                match previous.await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        session.close(true);
                        return false;
                    }
                }
            }

            if session.is_disposed() {
                return false;
            }

            let ok = session.process(block).await;
            if !ok {
                session.close(true);
            }
            ok
        }));
    }

    /// Remove this stream from its tunnel and dispose it
    fn close(&self, notify_peer: bool) {
        match self.tunnel.upgrade() {
            Some(tunnel) => tunnel.close_stream(self.id, notify_peer),
            None => self.dispose(),
        }
    }

    /// Start forwarding application data into the tunnel
    ///
    /// `initial` is sent before anything read from the application side.
    pub fn start_pump(self: &Arc<Self>, initial: Bytes) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if !initial.is_empty() {
                for chunk in initial.chunks(MAX_DATA_CHUNK) {
                    let payload = initial.slice_ref(chunk);
                    if let Err(e) = session.send(BlockType::Data, payload).await {
                        debug!("Stream {:032x}: send failed: {}", session.id, e);
                        session.close(false);
                        return;
                    }
                }
            }

            let mut buf = vec![0u8; MAX_DATA_CHUNK];
            loop {
                let n = match session.io.read_some(&mut buf).await {
                    Ok(0) => {
                        trace!("Stream {:032x}: local end closed", session.id);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        trace!("Stream {:032x}: local read stopped: {}", session.id, e);
                        break;
                    }
                };

                let payload = Bytes::copy_from_slice(&buf[..n]);
                if let Err(e) = session.send(BlockType::Data, payload).await {
                    debug!("Stream {:032x}: send failed: {}", session.id, e);
                    break;
                }
            }

            // Local teardown first; the peer learns about it from the next disconnect batch
            session.close(true);
        });

        *lock(&self.pump) = Some(handle);
    }

    /// Tear the stream down locally; idempotent
    ///
    /// A stream still waiting on CONNECT leaves its application connection
    /// open; whoever is waiting decides what happens to it.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        trace!(
            "Stream {:032x} (local {}) disposed",
            self.id,
            self.io.local_id()
        );
        if !self.resolve_connect(false) {
            self.io.on_disconnect();
        }
        self.pending.close();

        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        if let Some(chain) = lock(&self.chain).take() {
            chain.abort();
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &format_args!("{:032x}", self.id))
            .field("local_id", &self.io.local_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testing::{active_pair, fast_config, RecordingStream};
    use crate::tunnel::Role;
    use std::time::Duration;

    fn detached_tunnel() -> Arc<Tunnel> {
        let (_peer, local) = tokio::io::duplex(1024);
        Tunnel::from_stream(Role::Accepting, local, fast_config())
    }

    #[tokio::test]
    async fn test_data_is_written_to_local_end() {
        let tunnel = detached_tunnel();
        let io = RecordingStream::new();
        let session = StreamSession::new(5, io.clone(), &tunnel);

        assert!(session.process(Block::data(5, Bytes::from_static(b"abc"))).await);
        assert!(
            session
                .process(Block::data(5, Bytes::from_static(b"def")).with_sequence(1))
                .await
        );
        assert_eq!(io.written(), b"abcdef");
    }

    #[tokio::test]
    async fn test_connected_writes_success_reply_once() {
        let tunnel = detached_tunnel();
        let io = RecordingStream::new();
        let replies = ConnectReplies::new(&b"OK"[..], &b"NO"[..]);
        let session = StreamSession::with_replies(5, io.clone(), &tunnel, replies.clone());
        let waiter = session.expect_connect();

        assert!(session.process(Block::connected(5)).await);
        assert!(waiter.await.unwrap());
        assert!(replies.is_sent());

        replies.send(io.as_ref(), false).await.unwrap();
        assert_eq!(io.written(), b"OK");
    }

    #[tokio::test]
    async fn test_connect_failed_writes_failure_reply() {
        let tunnel = detached_tunnel();
        let io = RecordingStream::new();
        let replies = ConnectReplies::new(&b"OK"[..], &b"NO"[..]);
        let session = StreamSession::with_replies(5, io.clone(), &tunnel, replies);
        let waiter = session.expect_connect();

        assert!(!session.process(Block::connect_failed(5)).await);
        assert!(!waiter.await.unwrap());
        assert_eq!(io.written(), b"NO");
    }

    #[tokio::test]
    async fn test_connect_failed_with_broken_local_end() {
        let tunnel = detached_tunnel();
        let io = RecordingStream::new();
        let replies = ConnectReplies::new(&b"OK"[..], &b"NO"[..]);
        let session = StreamSession::with_replies(5, io.clone(), &tunnel, replies.clone());
        let waiter = session.expect_connect();

        io.on_disconnect();
        assert!(!session.process(Block::connect_failed(5)).await);
        assert!(!waiter.await.unwrap());
        assert!(replies.is_sent());
        assert!(io.written().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_while_connecting_keeps_local_end() {
        let tunnel = detached_tunnel();
        let io = RecordingStream::new();
        let session = StreamSession::with_replies(5, io.clone(), &tunnel, ConnectReplies::none());
        let waiter = session.expect_connect();

        session.dispose();
        assert!(!waiter.await.unwrap());
        assert!(!io.was_disconnected());

        // Once connected, dispose closes the local end
        let connected = StreamSession::new(6, io.clone(), &tunnel);
        connected.dispose();
        assert!(io.was_disconnected());
    }

    #[tokio::test]
    async fn test_invalid_block_fails_stream() {
        let tunnel = detached_tunnel();
        let session = StreamSession::new(5, RecordingStream::new(), &tunnel);

        let mut block = Block::data(5, Bytes::from_static(b"abc"));
        block.mark_invalid();
        assert!(!session.process(block).await);
    }

    #[tokio::test]
    async fn test_failed_block_stops_later_blocks() {
        let tunnel = detached_tunnel();
        let io = RecordingStream::new();
        let session = StreamSession::new(5, io.clone(), &tunnel);
        tunnel.register_stream(Arc::clone(&session)).unwrap();

        let mut bad = Block::data(5, Bytes::from_static(b"bad"));
        bad.mark_invalid();
        session.enqueue(bad, None);
        session.enqueue(Block::data(5, Bytes::from_static(b"late")), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(io.written().is_empty());
        assert!(session.is_disposed());
        assert!(!tunnel.contains_stream(5));
        assert_eq!(tunnel.pending_disconnects(), 1);
    }

    #[tokio::test]
    async fn test_pump_forwards_local_data_and_eof() {
        let (client, relay) = active_pair(fast_config()).await;

        let (app, local) = tokio::io::duplex(1024);
        let session = StreamSession::new(42, IoStream::new(local), &client);
        client.register_stream(Arc::clone(&session)).unwrap();
        session.start_pump(Bytes::from_static(b"head "));

        let (_app_read, mut app_write) = tokio::io::split(app);
        app_write.write_all(b"body").await.unwrap();
        app_write.shutdown().await.unwrap();

        let mut received = Vec::new();
        loop {
            let block = relay.decrypt_block(relay.read_block().await.unwrap());
            match block.block_type {
                BlockType::Data => {
                    assert_eq!(block.stream_id, 42);
                    received.extend_from_slice(&block.payload);
                }
                BlockType::Disconnect => {
                    assert_eq!(block.disconnect_ids().unwrap(), vec![42]);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(received, b"head body");
        assert!(!client.contains_stream(42));
    }
}
