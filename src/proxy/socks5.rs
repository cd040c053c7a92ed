//! SOCKS5 client-side framing (RFC 1928), no-authentication only.
//!
//! The decoders work on whatever has been buffered so far and return
//! `Ok(None)` when more bytes are needed.

use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("Unexpected method selection: version {version:#04x}, method {method:#04x}")]
    MethodRejected { version: u8, method: u8 },
    #[error("Invalid SOCKS version in reply: {version:#04x} (code {reply})")]
    InvalidVersion { version: u8, reply: u8 },
    #[error("Connect rejected with code {0} ({desc})", desc = describe_reply(.0))]
    ConnectRejected(u8),
    #[error("Unknown address type: {0:#04x}")]
    UnknownAddressType(u8),
    #[error("Hostname too long for SOCKS5: {0} bytes")]
    HostnameTooLong(usize),
}

/// Bound address carried in a CONNECT reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub bound: BoundAddr,
    pub port: u16,
    /// Total reply length; bytes after it belong to the tunnel.
    pub len: usize,
}

/// RFC 1928 §6 reply field names.
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned",
    }
}

fn describe_reply(code: &u8) -> &'static str {
    reply_message(*code)
}

/// Greeting offering the single no-authentication method.
pub fn greeting() -> [u8; 3] {
    [SOCKS5_VERSION, 0x01, METHOD_NO_AUTH]
}

/// Decodes the two-byte method selection.
pub fn parse_method_selection(buf: &[u8]) -> Result<Option<usize>, Socks5Error> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let (version, method) = (buf[0], buf[1]);
    if version != SOCKS5_VERSION || method != METHOD_NO_AUTH {
        return Err(Socks5Error::MethodRejected { version, method });
    }
    Ok(Some(2))
}

/// CONNECT request using the domain-name address type; the host is sent unresolved.
///
/// ```text
/// +----+-----+-------+------+-----+----------+----------+
/// |VER | CMD |  RSV  | ATYP | LEN | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+-----+----------+----------+
/// | 1  |  1  | X'00' | X'03'|  1  | Variable |    2     |
/// +----+-----+-------+------+-----+----------+----------+
/// ```
pub fn connect_request(host: &str, port: u16) -> Result<Vec<u8>, Socks5Error> {
    let host = host.as_bytes();
    if host.is_empty() || host.len() > u8::MAX as usize {
        return Err(Socks5Error::HostnameTooLong(host.len()));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host);
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// Decodes a CONNECT reply once `4 + addr_len + 2` bytes are buffered.
pub fn parse_connect_reply(buf: &[u8]) -> Result<Option<ConnectReply>, Socks5Error> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let version = buf[0];
    let reply = buf[1];
    let atyp = buf[3];

    let addr_len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_DOMAIN => match buf.get(4) {
            Some(len) => 1 + *len as usize,
            None => return Ok(None),
        },
        ATYP_IPV6 => 16,
        other => return Err(Socks5Error::UnknownAddressType(other)),
    };

    let total = 4 + addr_len + 2;
    if buf.len() < total {
        return Ok(None);
    }

    if version != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion { version, reply });
    }
    if reply != REPLY_SUCCEEDED {
        return Err(Socks5Error::ConnectRejected(reply));
    }

    let addr = &buf[4..4 + addr_len];
    let bound = match atyp {
        ATYP_IPV4 => BoundAddr::Ipv4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])),
        ATYP_DOMAIN => BoundAddr::Domain(String::from_utf8_lossy(&addr[1..]).into_owned()),
        _ => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            BoundAddr::Ipv6(Ipv6Addr::from(octets))
        }
    };
    let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);

    Ok(Some(ConnectReply {
        bound,
        port,
        len: total,
    }))
}
