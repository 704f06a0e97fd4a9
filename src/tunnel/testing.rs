//! Shared fixtures for tunnel tests

use super::{accept_handshake, connect_handshake, Dialer, LogicalStream, Role, Tunnel, TunnelConfig};
use crate::crypto::SecurityProvider;
use crate::protocol::Address;
use async_trait::async_trait;
use rand::Rng;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Short timers so tests finish quickly
pub(crate) fn fast_config() -> TunnelConfig {
    TunnelConfig {
        idle_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(2),
        idle_close: Duration::from_secs(60),
        disconnect_interval: Duration::from_millis(20),
        disconnect_batch: 512,
    }
}

pub(crate) fn test_provider(secret: &[u8]) -> SecurityProvider {
    SecurityProvider::from_names("chacha20-poly1305", "hkdf-sha256", "hmac-sha256", secret)
        .expect("known algorithms")
}

/// Two tunnels joined by an in-memory pipe, both through the standard handshake
pub(crate) async fn active_pair(config: TunnelConfig) -> (Arc<Tunnel>, Arc<Tunnel>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let client = Tunnel::from_stream(Role::Accepting, a, config.clone());
    let relay = Tunnel::from_stream(Role::Relay, b, config);
    let provider = test_provider(b"test secret");
    let dialer = MockDialer::refusing();

    let (connected, accepted) = tokio::join!(
        connect_handshake(&client, &provider),
        accept_handshake(&relay, &provider, &dialer)
    );
    connected.expect("client handshake");
    accepted.expect("relay handshake");
    (client, relay)
}

/// In-memory logical stream: records writes, reads block until disconnected
pub(crate) struct RecordingStream {
    written: Mutex<Vec<u8>>,
    jitter: Option<Duration>,
    closed: CancellationToken,
    disconnected: AtomicBool,
}

impl RecordingStream {
    pub(crate) fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Every write sleeps a random time up to `max`
    pub(crate) fn with_jitter(max: Duration) -> Arc<Self> {
        Self::build(Some(max))
    }

    fn build(jitter: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            written: Mutex::new(Vec::new()),
            jitter,
            closed: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
        })
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn was_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_len(&self, len: usize, limit: Duration) {
        tokio::time::timeout(limit, async {
            while self.written.lock().unwrap().len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stream did not receive enough data");
    }
}

#[async_trait]
impl LogicalStream for RecordingStream {
    fn local_id(&self) -> u64 {
        0
    }

    async fn read_some(&self, _buf: &mut [u8]) -> io::Result<usize> {
        self.closed.cancelled().await;
        Ok(0)
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if let Some(max) = self.jitter {
            let micros = rand::thread_rng().gen_range(0..=max.as_micros() as u64);
            tokio::time::sleep(Duration::from_micros(micros)).await;
        }
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}

    fn on_disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// Dialer that hands out one prepared stream, or refuses everything
pub(crate) struct MockDialer {
    stream: Mutex<Option<Arc<dyn LogicalStream>>>,
    dialed: Mutex<Vec<Address>>,
    delay: Duration,
}

impl MockDialer {
    pub(crate) fn refusing() -> Self {
        Self {
            stream: Mutex::new(None),
            dialed: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_stream(stream: Arc<dyn LogicalStream>) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            dialed: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Hands out `stream` only after `delay`
    pub(crate) fn with_delayed_stream(stream: Arc<dyn LogicalStream>, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::with_stream(stream)
        }
    }

    pub(crate) fn has_stream(&self) -> bool {
        self.stream.lock().unwrap().is_some()
    }

    pub(crate) fn dialed(&self) -> Vec<Address> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, target: &Address) -> io::Result<Arc<dyn LogicalStream>> {
        self.dialed.lock().unwrap().push(target.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }
}
