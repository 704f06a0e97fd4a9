//! SOCKS5 proxy implementation (RFC 1928, RFC 1929)

use super::{Address, Credentials, ProxyError, ProxyRequest};
use crate::tunnel::ConnectReplies;
use bytes::Bytes;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Username/password sub-negotiation version
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    /// Optional username/password authentication
    auth: Option<Credentials>,
}

impl Socks5Server {
    /// Create a new SOCKS5 server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            auth: None,
        })
    }

    /// Enable username/password authentication
    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections and hand every negotiated CONNECT to `handler`
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(ProxyRequest<TcpStream>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New SOCKS5 connection from {}", peer_addr);
            let _ = stream.set_nodelay(true);

            let handler = handler.clone();
            let auth = self.auth.clone();

            tokio::spawn(async move {
                match Self::negotiate(stream, auth.as_ref()).await {
                    Ok(request) => handler(request).await,
                    Err(e) => warn!("SOCKS5 negotiation with {} failed: {}", peer_addr, e),
                }
            });
        }
    }

    /// Run the SOCKS5 negotiation up to (not including) the connect reply
    pub async fn negotiate<S>(
        mut stream: S,
        auth: Option<&Credentials>,
    ) -> Result<ProxyRequest<S>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; 258];
        stream.read_exact(&mut buf[..2]).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(buf[0]));
        }

        let nmethods = buf[1] as usize;
        stream.read_exact(&mut buf[..nmethods]).await?;
        let offered = &buf[..nmethods];

        let method = if auth.is_some() {
            if offered.contains(&(AuthMethod::UsernamePassword as u8)) {
                AuthMethod::UsernamePassword
            } else {
                AuthMethod::NoAcceptable
            }
        } else if offered.contains(&(AuthMethod::NoAuth as u8)) {
            AuthMethod::NoAuth
        } else {
            AuthMethod::NoAcceptable
        };

        stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

        if method == AuthMethod::NoAcceptable {
            return Err(ProxyError::AuthenticationFailed);
        }

        if let (AuthMethod::UsernamePassword, Some(expected)) = (method, auth) {
            stream.read_exact(&mut buf[..2]).await?;
            if buf[0] != AUTH_VERSION {
                return Err(ProxyError::AuthenticationFailed);
            }
            let ulen = buf[1] as usize;
            stream.read_exact(&mut buf[..ulen]).await?;
            let username = String::from_utf8_lossy(&buf[..ulen]).to_string();

            stream.read_exact(&mut buf[..1]).await?;
            let plen = buf[0] as usize;
            stream.read_exact(&mut buf[..plen]).await?;
            let password = String::from_utf8_lossy(&buf[..plen]).to_string();

            let success = username == expected.username && password == expected.password;
            stream
                .write_all(&[AUTH_VERSION, if success { 0x00 } else { 0x01 }])
                .await?;

            if !success {
                return Err(ProxyError::AuthenticationFailed);
            }
        }

        stream.read_exact(&mut buf[..4]).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(buf[0]));
        }

        let command = buf[1];
        // buf[2] is reserved
        let addr_type = match AddressType::try_from(buf[3]) {
            Ok(t) => t,
            Err(e) => {
                let reply = make_reply(Reply::AddressTypeNotSupported, &Address::Ipv4([0; 4], 0));
                stream.write_all(&reply).await?;
                return Err(e);
            }
        };

        let address = match addr_type {
            AddressType::Ipv4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                Address::Ipv4(ip, stream.read_u16().await?)
            }
            AddressType::Domain => {
                stream.read_exact(&mut buf[..1]).await?;
                let len = buf[0] as usize;
                stream.read_exact(&mut buf[..len]).await?;
                let domain = String::from_utf8(buf[..len].to_vec())
                    .map_err(|_| ProxyError::InvalidAddress("non UTF-8 domain".to_string()))?;
                Address::Domain(domain, stream.read_u16().await?)
            }
            AddressType::Ipv6 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                Address::Ipv6(ip, stream.read_u16().await?)
            }
        };

        match Command::try_from(command) {
            Ok(Command::Connect) => {
                debug!("SOCKS5 CONNECT to {}", address);
                Ok(ProxyRequest {
                    stream,
                    replies: ConnectReplies::new(
                        make_reply(Reply::Succeeded, &address),
                        make_reply(Reply::HostUnreachable, &address),
                    ),
                    target: address,
                    initial_data: Bytes::new(),
                })
            }
            // UDP relay is not carried by the tunnel
            Ok(Command::Bind) | Ok(Command::UdpAssociate) | Err(_) => {
                let reply = make_reply(Reply::CommandNotSupported, &address);
                stream.write_all(&reply).await?;
                Err(ProxyError::UnsupportedCommand(command))
            }
        }
    }
}

fn make_reply(reply: Reply, addr: &Address) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];
    buf.extend_from_slice(&addr.encode());
    buf
}
