//! HTTP proxy implementation
//!
//! `CONNECT host:port` opens a raw tunnel. Plain requests with an absolute
//! URI (`GET http://host/path HTTP/1.1`) are forwarded with their request
//! head rewritten to origin form; the connection is closed after one exchange.

use super::{Address, Credentials, ProxyError, ProxyRequest};
use crate::tunnel::ConnectReplies;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use std::future::Future;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Longest request head accepted
const MAX_HEAD_SIZE: usize = 16 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// HTTP proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
    /// Optional basic authentication
    auth: Option<Credentials>,
}

impl HttpProxyServer {
    /// Create a new HTTP proxy server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            auth: None,
        })
    }

    /// Enable basic authentication
    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections and hand every parsed request to `handler`
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(ProxyRequest<TcpStream>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New HTTP proxy connection from {}", peer_addr);
            let _ = stream.set_nodelay(true);

            let handler = handler.clone();
            let auth = self.auth.clone();

            tokio::spawn(async move {
                match Self::negotiate(stream, auth.as_ref()).await {
                    Ok(request) => handler(request).await,
                    Err(e) => warn!("HTTP proxy request from {} failed: {}", peer_addr, e),
                }
            });
        }
    }

    /// Read the request head and decide where it goes
    pub async fn negotiate<S>(
        stream: S,
        auth: Option<&Credentials>,
    ) -> Result<ProxyRequest<S>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);

        let mut request_line = String::new();
        read_head_line(&mut reader, &mut request_line, 0).await?;
        let mut head_size = request_line.len();

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(ProxyError::BadRequest("invalid request line".to_string()));
        }
        let (method, target, version) = (parts[0], parts[1], parts[2]);

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            read_head_line(&mut reader, &mut line, head_size).await?;
            head_size += line.len();

            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.push((key.trim().to_string(), value.trim().to_string()));
            }
        }

        if let Some(expected) = auth {
            let authorized = header(&headers, "proxy-authorization")
                .map(|value| check_basic_auth(value, expected))
                .unwrap_or(false);

            if !authorized {
                let stream = reader.get_mut();
                stream
                    .write_all(
                        b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                          Proxy-Authenticate: Basic realm=\"shroud\"\r\n\
                          Content-Length: 0\r\n\r\n",
                    )
                    .await?;
                return Err(ProxyError::AuthenticationFailed);
            }
        }

        // Client bytes already buffered past the head belong to the target
        let buffered = Bytes::copy_from_slice(reader.buffer());

        if method.eq_ignore_ascii_case("CONNECT") {
            let address = Address::parse(target)
                .map_err(|_| ProxyError::InvalidAddress(target.to_string()))?;
            debug!("HTTP CONNECT to {}", address);

            return Ok(ProxyRequest {
                stream: reader.into_inner(),
                target: address,
                replies: ConnectReplies::new(CONNECT_ESTABLISHED, BAD_GATEWAY),
                initial_data: buffered,
            });
        }

        let (address, path) = match parse_absolute_uri(target) {
            Ok(parsed) => parsed,
            Err(e) => {
                reader
                    .get_mut()
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                    .await?;
                return Err(e);
            }
        };
        debug!("HTTP {} to {}{}", method, address, path);

        let mut head = BytesMut::with_capacity(head_size + buffered.len());
        head.put_slice(format!("{} {} {}\r\n", method, path, version).as_bytes());
        for (key, value) in &headers {
            if is_hop_by_hop(key) {
                continue;
            }
            head.put_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }
        head.put_slice(b"Connection: close\r\n\r\n");
        head.put_slice(&buffered);

        Ok(ProxyRequest {
            stream: reader.into_inner(),
            target: address,
            replies: ConnectReplies::new(Bytes::new(), BAD_GATEWAY),
            initial_data: head.freeze(),
        })
    }
}

async fn read_head_line<R>(
    reader: &mut BufReader<R>,
    line: &mut String,
    head_size: usize,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
{
    let n = reader.read_line(line).await?;
    if n == 0 {
        return Err(ProxyError::BadRequest("connection closed mid-request".to_string()));
    }
    if head_size + n > MAX_HEAD_SIZE {
        return Err(ProxyError::BadRequest("request head too large".to_string()));
    }
    Ok(())
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn is_hop_by_hop(name: &str) -> bool {
    ["proxy-authorization", "proxy-connection", "connection", "keep-alive"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

fn check_basic_auth(value: &str, expected: &Credentials) -> bool {
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((user, pass)) => user == expected.username && pass == expected.password,
        None => false,
    }
}

/// Split `http://host[:port]/path?query` into target and origin-form path
fn parse_absolute_uri(uri: &str) -> Result<(Address, String), ProxyError> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| ProxyError::BadRequest(format!("unsupported URI: {}", uri)))?;

    let (authority, path) = match rest.find(|c: char| c == '/' || c == '?') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let path = if path.starts_with('?') {
        format!("/{}", path)
    } else {
        path.to_string()
    };

    // Drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.is_empty() {
        return Err(ProxyError::InvalidAddress(uri.to_string()));
    }

    let has_port = match authority.rfind(':') {
        Some(i) => !authority[i..].contains(']'),
        None => false,
    };
    let address = if has_port {
        Address::parse(authority)
    } else {
        Address::parse(&format!("{}:80", authority))
    }
    .map_err(|_| ProxyError::InvalidAddress(authority.to_string()))?;

    Ok((address, path))
}
