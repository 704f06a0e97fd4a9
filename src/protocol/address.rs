//! Target address carried in CONNECT payloads
//!
//! Encoded in SOCKS5 style:
//! ```text
//! +------+----------------------+----------+
//! | ATYP |       Address        | Port(2B) |
//! +------+----------------------+----------+
//!  0x01    4 bytes (IPv4)
//!  0x03    1 byte length + name
//!  0x04    16 bytes (IPv6)
//! ```

use super::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) | Address::Ipv6(_, port) | Address::Domain(_, port) => *port,
        }
    }

    /// Socket address for IP targets; domains need resolving first
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Ipv4(ip, port) => Some(SocketAddr::from((Ipv4Addr::from(*ip), *port))),
            Address::Ipv6(ip, port) => Some(SocketAddr::from((Ipv6Addr::from(*ip), *port))),
            Address::Domain(..) => None,
        }
    }

    /// Parse a `host:port` string (IPv6 hosts may be bracketed)
    pub fn parse(target: &str) -> Result<Self, ProtocolError> {
        let (host, port_str) = target
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::InvalidAddress(target.to_string()))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(target.to_string()))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ProtocolError::InvalidAddress(target.to_string()));
        }

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            Ok(Address::Ipv4(ip.octets(), port))
        } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
            Ok(Address::Ipv6(ip.octets(), port))
        } else if host.len() > u8::MAX as usize {
            Err(ProtocolError::InvalidAddress(format!("domain too long: {}", host.len())))
        } else {
            Ok(Address::Domain(host.to_string(), port))
        }
    }

    /// Encode into the CONNECT payload format
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            Address::Ipv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
            Address::Ipv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
            Address::Domain(domain, port) => {
                // Domain length is checked on construction from untrusted input
                let name = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name);
                buf.put_u16(*port);
            }
        }
        buf.freeze()
    }

    /// Decode from the CONNECT payload format
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (&atyp, rest) = payload
            .split_first()
            .ok_or_else(|| ProtocolError::InvalidAddress("empty address".to_string()))?;

        match atyp {
            ATYP_IPV4 => {
                if rest.len() != 6 {
                    return Err(ProtocolError::InvalidAddress("invalid IPv4".to_string()));
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&rest[..4]);
                Ok(Address::Ipv4(ip, u16::from_be_bytes([rest[4], rest[5]])))
            }
            ATYP_IPV6 => {
                if rest.len() != 18 {
                    return Err(ProtocolError::InvalidAddress("invalid IPv6".to_string()));
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&rest[..16]);
                Ok(Address::Ipv6(ip, u16::from_be_bytes([rest[16], rest[17]])))
            }
            ATYP_DOMAIN => {
                let (&len, rest) = rest
                    .split_first()
                    .ok_or_else(|| ProtocolError::InvalidAddress("invalid domain".to_string()))?;
                let len = len as usize;
                if rest.len() != len + 2 {
                    return Err(ProtocolError::InvalidAddress("invalid domain".to_string()));
                }
                let domain = std::str::from_utf8(&rest[..len])
                    .map_err(|_| ProtocolError::InvalidAddress("domain is not UTF-8".to_string()))?;
                Ok(Address::Domain(
                    domain.to_string(),
                    u16::from_be_bytes([rest[len], rest[len + 1]]),
                ))
            }
            other => Err(ProtocolError::InvalidAddress(format!(
                "unknown address type: {:#04x}",
                other
            ))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
