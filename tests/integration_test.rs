//! Integration tests for Shroud
//!
//! Runs a relay, a client and local proxy front-ends on loopback and checks
//! the full path:
//! - SOCKS5 and HTTP CONNECT through a tunnel
//! - Fast connect and the standard handshake
//! - Several streams sharing a capped tunnel pool
//! - Failure replies for unreachable targets and rejected tunnels

use shroud::client::{Client, ClientOptions};
use shroud::crypto::SecurityProvider;
use shroud::proxy::{HttpProxyServer, Socks5Server};
use shroud::server::{Server, TcpDialer};
use shroud::tunnel::TunnelConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const SECRET: &[u8] = b"integration secret";

fn tunnel_config() -> TunnelConfig {
    TunnelConfig {
        idle_timeout: Duration::from_secs(10),
        handshake_timeout: Duration::from_secs(3),
        idle_close: Duration::from_secs(60),
        disconnect_interval: Duration::from_millis(20),
        disconnect_batch: 512,
    }
}

fn provider(secret: &[u8]) -> SecurityProvider {
    SecurityProvider::from_names("chacha20-poly1305", "hkdf-sha256", "hmac-sha256", secret)
        .expect("known algorithms")
}

/// Echo server; every connection gets its bytes back
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// A loopback port nobody listens on
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

struct Relay {
    addr: SocketAddr,
    server: Arc<Server>,
    shutdown: CancellationToken,
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_relay(secret: &[u8]) -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(
        provider(secret),
        tunnel_config(),
        Arc::new(TcpDialer::new(Duration::from_secs(2))),
        64,
    );
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&server).run(listener, shutdown.clone()));

    Relay {
        addr,
        server,
        shutdown,
    }
}

fn new_client(relay: SocketAddr, secret: &[u8], fast_connect: bool, max_tunnels: usize) -> Arc<Client> {
    Client::new(
        ClientOptions {
            server: relay.to_string(),
            max_tunnels,
            fast_connect,
            tunnel: tunnel_config(),
        },
        provider(secret),
    )
}

/// Local SOCKS5 front-end feeding `client`
async fn start_socks5(client: &Arc<Client>) -> SocketAddr {
    let server = Socks5Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let client = Arc::clone(client);
    tokio::spawn(async move {
        let _ = server
            .run(move |request| Arc::clone(&client).handle_request(request))
            .await;
    });
    addr
}

/// SOCKS5 CONNECT to an IPv4 target; returns the socket and the reply code
async fn socks5_connect(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let ip = match target.ip() {
        std::net::IpAddr::V4(ip) => ip.octets(),
        std::net::IpAddr::V6(_) => panic!("IPv4 targets only"),
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip);
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .expect("proxy reply")
        .unwrap();
    assert_eq!(reply[0], 0x05);
    (stream, reply[1])
}

async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut received))
        .await
        .expect("echo in time")
        .unwrap();
    assert_eq!(received, payload);
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_socks5_echo_with_fast_connect() {
    let echo = start_echo().await;
    let relay = start_relay(SECRET).await;
    let client = new_client(relay.addr, SECRET, true, 1);
    let proxy = start_socks5(&client).await;

    let (mut first, status) = socks5_connect(proxy, echo).await;
    assert_eq!(status, 0x00);
    assert_echo(&mut first, b"hello through the tunnel").await;

    // The second stream reuses the only tunnel with CONNECT
    let (mut second, status) = socks5_connect(proxy, echo).await;
    assert_eq!(status, 0x00);
    assert_echo(&mut second, b"second stream").await;
    assert_echo(&mut first, b"first stream still works").await;

    assert_eq!(client.pool().active_count(), 1);
    assert!(wait_for(|| relay.server.tunnel_count() == 1).await);
    client.shutdown();
}

#[tokio::test]
async fn test_socks5_echo_with_standard_handshake() {
    let echo = start_echo().await;
    let relay = start_relay(SECRET).await;
    let client = new_client(relay.addr, SECRET, false, 2);
    let proxy = start_socks5(&client).await;

    let (mut stream, status) = socks5_connect(proxy, echo).await;
    assert_eq!(status, 0x00);
    assert_echo(&mut stream, b"ping").await;
    client.shutdown();
}

#[tokio::test]
async fn test_concurrent_streams_share_capped_pool() {
    let echo = start_echo().await;
    let relay = start_relay(SECRET).await;
    let client = new_client(relay.addr, SECRET, true, 2);
    let proxy = start_socks5(&client).await;

    let mut handles = Vec::new();
    for i in 0..10u8 {
        handles.push(tokio::spawn(async move {
            let (stream, status) = socks5_connect(proxy, echo).await;
            assert_eq!(status, 0x00);

            // Larger than one DATA block
            let payload: Vec<u8> = (0..100_000u32).map(|n| (n as u8).wrapping_add(i)).collect();
            let (mut reader, mut writer) = stream.into_split();
            let expected = payload.clone();
            let write = tokio::spawn(async move {
                writer.write_all(&payload).await.unwrap();
                writer
            });

            let mut received = vec![0u8; expected.len()];
            tokio::time::timeout(Duration::from_secs(10), reader.read_exact(&mut received))
                .await
                .expect("echo in time")
                .unwrap();
            assert_eq!(received, expected);
            let _writer = write.await.unwrap();
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(client.pool().active_count() <= 2);
    assert!(relay.server.tunnel_count() <= 2);
    client.shutdown();
}

#[tokio::test]
async fn test_unreachable_target_gets_failure_reply() {
    let relay = start_relay(SECRET).await;
    let target = closed_port().await;

    for fast_connect in [true, false] {
        let client = new_client(relay.addr, SECRET, fast_connect, 1);
        let proxy = start_socks5(&client).await;

        let (mut stream, status) = socks5_connect(proxy, target).await;
        assert_eq!(status, 0x04, "fast_connect = {}", fast_connect);

        // The proxy hangs up after the failure reply
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("close in time")
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The tunnel itself survives the failed stream
        let echo = start_echo().await;
        let (mut stream, status) = socks5_connect(proxy, echo).await;
        assert_eq!(status, 0x00);
        assert_echo(&mut stream, b"still usable").await;
        assert_eq!(client.pool().active_count(), 1);
        client.shutdown();
    }
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let echo = start_echo().await;
    let relay = start_relay(SECRET).await;

    for fast_connect in [true, false] {
        let client = new_client(relay.addr, b"not the secret", fast_connect, 1);
        let proxy = start_socks5(&client).await;

        let (_stream, status) = socks5_connect(proxy, echo).await;
        assert_eq!(status, 0x04, "fast_connect = {}", fast_connect);
        assert_eq!(client.pool().active_count(), 0);
        assert_eq!(relay.server.tunnel_count(), 0);
    }
}

#[tokio::test]
async fn test_http_connect_through_tunnel() {
    let echo = start_echo().await;
    let relay = start_relay(SECRET).await;
    let client = new_client(relay.addr, SECRET, true, 1);

    let http = HttpProxyServer::bind("127.0.0.1:0").await.unwrap();
    let proxy = http.local_addr().unwrap();
    {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let _ = http
                .run(move |request| Arc::clone(&client).handle_request(request))
                .await;
        });
    }

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", echo, echo).as_bytes())
        .await
        .unwrap();

    let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    let mut response = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut response))
        .await
        .expect("CONNECT reply")
        .unwrap();
    assert_eq!(&response, expected);

    assert_echo(&mut stream, b"raw bytes after CONNECT").await;
    client.shutdown();
}

#[tokio::test]
async fn test_closing_client_side_closes_target() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let relay = start_relay(SECRET).await;
    let client = new_client(relay.addr, SECRET, true, 1);
    let proxy = start_socks5(&client).await;

    let (stream, status) = socks5_connect(proxy, target_addr).await;
    assert_eq!(status, 0x00);
    let (mut accepted, _) = target.accept().await.unwrap();

    drop(stream);

    // The DISCONNECT reaches the relay, which drops its outbound socket
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), accepted.read(&mut buf))
        .await
        .expect("target sees the close")
        .unwrap_or(0);
    assert_eq!(n, 0);

    // The tunnel stays up for later streams
    assert!(!relay.shutdown.is_cancelled());
    assert_eq!(client.pool().active_count(), 1);
    client.shutdown();
}
