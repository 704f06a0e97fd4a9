//! Accepting side: opens logical streams over pooled tunnels
//!
//! The first stream of a new tunnel rides on FAST_CONNECT (when enabled);
//! every other stream sends CONNECT on an already active tunnel and waits
//! for CONNECTED or CONNECT_FAILED.

use crate::crypto::SecurityProvider;
use crate::protocol::Address;
use crate::proxy::ProxyRequest;
use crate::tunnel::{
    connect_handshake, fast_connect, Acquired, BlockType, ConnectReplies, FastConnectOutcome,
    IoStream, LogicalStream, Multiplexer, Role, StreamError, StreamId, StreamSession, Tunnel,
    TunnelConfig, TunnelError, TunnelPool,
};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relay address
    pub server: String,
    /// Maximum concurrent tunnels (0 = unbounded)
    pub max_tunnels: usize,
    /// Use FAST_CONNECT for the first stream of a new tunnel
    pub fast_connect: bool,
    /// Tunnel timers
    pub tunnel: TunnelConfig,
}

/// Proxy client: turns proxy requests into logical streams
pub struct Client {
    options: ClientOptions,
    provider: SecurityProvider,
    pool: Arc<TunnelPool>,
    receive_loops: Mutex<JoinSet<()>>,
}

/// Tunnels tried for one stream before giving up
const OPEN_ATTEMPTS: usize = 3;

/// Fresh random stream id; `0` is reserved
fn new_stream_id() -> StreamId {
    loop {
        let id: StreamId = rand::random();
        if id != 0 {
            return id;
        }
    }
}

impl Client {
    pub fn new(options: ClientOptions, provider: SecurityProvider) -> Arc<Self> {
        Arc::new(Self {
            pool: Arc::new(TunnelPool::new(options.max_tunnels)),
            options,
            provider,
            receive_loops: Mutex::new(JoinSet::new()),
        })
    }

    pub fn pool(&self) -> &TunnelPool {
        &self.pool
    }

    /// Serve one negotiated proxy request; failures are answered with the
    /// request's failure reply and the client connection is closed
    pub async fn handle_request<S>(self: Arc<Self>, request: ProxyRequest<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let ProxyRequest {
            stream,
            target,
            replies,
            initial_data,
        } = request;
        let io = IoStream::new(stream);

        let opened = self
            .open_stream(target.clone(), io.clone(), Arc::clone(&replies), initial_data)
            .await;

        if let Err(e) = opened {
            warn!("Cannot open stream to {}: {}", target, e);
            if let Err(e) = replies.send(io.as_ref(), false).await {
                debug!("Cannot write failure reply: {}", e);
            }
            io.shutdown().await;
        }
    }

    /// Open a logical stream to `target` carried by a pooled tunnel
    ///
    /// `initial` is forwarded before anything read from `io`. When the
    /// tunnel dies before the relay answered CONNECT, the stream is retried
    /// on another tunnel with a fresh stream id.
    pub async fn open_stream(
        &self,
        target: Address,
        io: Arc<dyn LogicalStream>,
        replies: Arc<ConnectReplies>,
        initial: Bytes,
    ) -> Result<Arc<StreamSession>, crate::Error> {
        let mut attempt = 1;
        loop {
            let stream_id = new_stream_id();

            let acquired = self
                .pool
                .acquire(|| self.create_tunnel(stream_id, &target))
                .await?;

            let (tunnel, opened) = match acquired {
                Acquired::Created(tunnel, Some(outcome)) => {
                    let opened = self
                        .finish_fast_connect(
                            Arc::clone(&tunnel),
                            outcome,
                            stream_id,
                            &target,
                            io.clone(),
                            Arc::clone(&replies),
                            initial.clone(),
                        )
                        .await;
                    (tunnel, opened)
                }
                Acquired::Created(tunnel, None) => {
                    self.spawn_receive_loop(Arc::clone(&tunnel));
                    let opened = self
                        .connect_on(&tunnel, stream_id, &target, io.clone(), Arc::clone(&replies), initial.clone())
                        .await;
                    (tunnel, opened)
                }
                Acquired::Reused(tunnel) => {
                    let opened = self
                        .connect_on(&tunnel, stream_id, &target, io.clone(), Arc::clone(&replies), initial.clone())
                        .await;
                    (tunnel, opened)
                }
            };

            match opened {
                // Nothing reached the application yet, so another tunnel can take over
                Err(e) if tunnel.is_closed() && !replies.is_sent() && attempt < OPEN_ATTEMPTS => {
                    info!(
                        "Tunnel {} closed while opening a stream to {} ({}), retrying",
                        tunnel, target, e
                    );
                    self.pool.release(&tunnel);
                    attempt += 1;
                }
                opened => return opened,
            }
        }
    }

    /// Connect to the relay and authenticate, fast-connecting `stream_id` when enabled
    async fn create_tunnel(
        &self,
        stream_id: StreamId,
        target: &Address,
    ) -> Result<(Arc<Tunnel>, Option<FastConnectOutcome>), TunnelError> {
        let connect = TcpStream::connect(&self.options.server);
        let stream = tokio::time::timeout(self.options.tunnel.handshake_timeout, connect)
            .await
            .map_err(|_| TunnelError::Timeout)??;
        stream.set_nodelay(true)?;

        let tunnel = Tunnel::from_stream(Role::Accepting, stream, self.options.tunnel.clone());

        if self.options.fast_connect {
            let outcome = fast_connect(&tunnel, &self.provider, stream_id, target).await?;
            info!("Tunnel {} established with fast connect", tunnel);
            Ok((tunnel, Some(outcome)))
        } else {
            connect_handshake(&tunnel, &self.provider).await?;
            info!("Tunnel {} established", tunnel);
            Ok((tunnel, None))
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_fast_connect(
        &self,
        tunnel: Arc<Tunnel>,
        outcome: FastConnectOutcome,
        stream_id: StreamId,
        target: &Address,
        io: Arc<dyn LogicalStream>,
        replies: Arc<ConnectReplies>,
        initial: Bytes,
    ) -> Result<Arc<StreamSession>, crate::Error> {
        if outcome == FastConnectOutcome::Failed {
            self.spawn_receive_loop(tunnel);
            return Err(StreamError::ConnectFailed(target.to_string()).into());
        }

        let session = StreamSession::fast_connected(stream_id, io, &tunnel, replies);
        tunnel.register_stream(Arc::clone(&session))?;

        // The reply goes out before the receive loop can deliver any DATA
        let replied = session.replies().send(session.io().as_ref(), true).await;
        self.spawn_receive_loop(Arc::clone(&tunnel));

        if let Err(e) = replied {
            tunnel.close_stream(stream_id, true);
            return Err(StreamError::Io(e).into());
        }

        session.start_pump(initial);
        Ok(session)
    }

    /// Open a stream with CONNECT on an active tunnel
    async fn connect_on(
        &self,
        tunnel: &Arc<Tunnel>,
        stream_id: StreamId,
        target: &Address,
        io: Arc<dyn LogicalStream>,
        replies: Arc<ConnectReplies>,
        initial: Bytes,
    ) -> Result<Arc<StreamSession>, crate::Error> {
        let session = StreamSession::with_replies(stream_id, io, tunnel, replies);
        let connected = session.expect_connect();
        tunnel.register_stream(Arc::clone(&session))?;

        if let Err(e) = session.send(BlockType::Connect, target.encode()).await {
            tunnel.close_stream(stream_id, false);
            return Err(e.into());
        }

        match tokio::time::timeout(self.options.tunnel.handshake_timeout, connected).await {
            Ok(Ok(true)) => {
                session.start_pump(initial);
                Ok(session)
            }
            Ok(_) if tunnel.is_closed() => Err(TunnelError::Closed.into()),
            Ok(_) => Err(StreamError::ConnectFailed(target.to_string()).into()),
            Err(_) => {
                if let Err(e) = session.replies().send(session.io().as_ref(), false).await {
                    debug!("Stream {:032x}: cannot write failure reply: {}", stream_id, e);
                }
                tunnel.close_stream(stream_id, true);
                Err(StreamError::ConnectTimeout.into())
            }
        }
    }

    /// Run the tunnel's receive loop; the pool forgets the tunnel when it ends
    fn spawn_receive_loop(&self, tunnel: Arc<Tunnel>) {
        let mut loops = self.receive_loops.lock().unwrap_or_else(|p| p.into_inner());
        while loops.try_join_next().is_some() {}

        let multiplexer = Multiplexer::new(Arc::clone(&tunnel), None);
        let pool = Arc::clone(&self.pool);
        loops.spawn(async move {
            if let Err(e) = multiplexer.run().await {
                debug!("Tunnel {} ended: {}", tunnel, e);
            }
            pool.release(&tunnel);
        });
    }

    /// Drop every tunnel and stop their receive loops
    pub fn shutdown(&self) {
        self.pool.close_all();
        self.receive_loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .abort_all();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.options)
            .field("provider", &self.provider)
            .field("active_tunnels", &self.pool.active_count())
            .finish()
    }
}
