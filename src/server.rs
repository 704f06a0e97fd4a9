//! Relay side: accepts tunnels and dials the targets their streams ask for

use crate::crypto::SecurityProvider;
use crate::protocol::Address;
use crate::tunnel::{
    accept_handshake, Accepted, Dialer, IoStream, LogicalStream, Multiplexer, Role, Tunnel,
    TunnelConfig, TunnelError, TunnelId,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Dials targets with plain TCP
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &Address) -> io::Result<Arc<dyn LogicalStream>> {
        let connect = async {
            match target {
                Address::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
                other => match other.to_socket_addr() {
                    Some(addr) => TcpStream::connect(addr).await,
                    None => Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unroutable address {}", other),
                    )),
                },
            }
        };

        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", target)))??;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", target);

        Ok(IoStream::new(stream))
    }
}

/// Relay server
pub struct Server {
    provider: Arc<SecurityProvider>,
    tunnel_config: TunnelConfig,
    dialer: Arc<dyn Dialer>,
    tunnels: DashMap<TunnelId, Arc<Tunnel>>,
    connections: Arc<Semaphore>,
}

impl Server {
    pub fn new(
        provider: SecurityProvider,
        tunnel_config: TunnelConfig,
        dialer: Arc<dyn Dialer>,
        max_connections: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider: Arc::new(provider),
            tunnel_config,
            dialer,
            tunnels: DashMap::new(),
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    /// Number of tunnels that finished their handshake and are still open
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Accept tunnel connections until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), crate::Error> {
        info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.connections).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("New tunnel connection from {}", peer_addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_connection(stream).await {
                            debug!("Tunnel from {} ended: {}", peer_addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }

        info!("Relay shutting down, closing {} tunnel(s)", self.tunnels.len());
        for entry in self.tunnels.iter() {
            entry.value().dispose("server shutdown");
        }
        Ok(())
    }

    /// Handshake one tunnel connection and run its receive loop to the end
    pub async fn serve_connection(&self, stream: TcpStream) -> Result<(), TunnelError> {
        stream.set_nodelay(true)?;
        let tunnel = Tunnel::from_stream(Role::Relay, stream, self.tunnel_config.clone());

        let Accepted {
            tunnel_id,
            first_stream,
        } = match accept_handshake(&tunnel, &self.provider, self.dialer.as_ref()).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Tunnel handshake failed: {}", e);
                return Err(e);
            }
        };

        // The tunnel registry owns the first stream from here on
        let fast = first_stream.is_some();
        drop(first_stream);

        info!(
            "Tunnel {} established{}",
            tunnel,
            if fast { " with fast connect" } else { "" }
        );
        self.tunnels.insert(tunnel_id, Arc::clone(&tunnel));

        let result = Multiplexer::new(Arc::clone(&tunnel), Some(Arc::clone(&self.dialer)))
            .run()
            .await;

        self.tunnels.remove(&tunnel_id);
        info!("Tunnel {} closed", tunnel);
        result
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("provider", &self.provider)
            .field("tunnel_config", &self.tunnel_config)
            .field("tunnels", &self.tunnels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hi").await.unwrap();
        });

        let dialer = TcpDialer::new(Duration::from_secs(2));
        let stream = dialer
            .dial(&Address::Ipv4([127, 0, 0, 1], addr.port()))
            .await
            .unwrap();

        let mut buf = [0u8; 2];
        let mut read = 0;
        while read < 2 {
            read += stream.read_some(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = TcpDialer::new(Duration::from_secs(2));
        assert!(dialer.dial(&Address::Ipv4([127, 0, 0, 1], port)).await.is_err());
    }

    fn provider() -> SecurityProvider {
        SecurityProvider::from_names("chacha20-poly1305", "hkdf-sha256", "hmac-sha256", b"secret")
            .unwrap()
    }

    async fn start_server() -> (Arc<Server>, std::net::SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(
            provider(),
            TunnelConfig::default(),
            Arc::new(TcpDialer::new(Duration::from_secs(1))),
            8,
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&server).run(listener, shutdown.clone()));
        (server, addr, shutdown)
    }

    #[tokio::test]
    async fn test_bad_handshake_is_not_registered() {
        let (server, addr, shutdown) = start_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0u8; 64]).await.unwrap();
        let mut buf = [0u8; 16];
        // The relay hangs up on garbage
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.tunnel_count(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_fast_connect_stream_released_on_disconnect() {
        use crate::tunnel::{fast_connect, Block, FastConnectOutcome};

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let (server, addr, shutdown) = start_server().await;

        let tunnel = Tunnel::from_stream(
            Role::Accepting,
            TcpStream::connect(addr).await.unwrap(),
            TunnelConfig::default(),
        );
        let outcome = fast_connect(
            &tunnel,
            &provider(),
            21,
            &Address::Ipv4([127, 0, 0, 1], target_port),
        )
        .await
        .unwrap();
        assert_eq!(outcome, FastConnectOutcome::Connected);
        let (mut outbound, _) = target.accept().await.unwrap();

        tunnel.send_block(Block::disconnect(&[21])).await.unwrap();

        // The relay drops its outbound socket for the first stream
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), outbound.read(&mut buf))
            .await
            .expect("target sees the close")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.tunnel_count(), 1);

        shutdown.cancel();
    }
}
