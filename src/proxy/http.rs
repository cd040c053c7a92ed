use std::collections::HashMap;
use thiserror::Error;
use url::{Host, Url};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
/// Upper bound on the request line plus headers.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HOSTNAME_LEN: usize = 255;

#[derive(Error, Debug)]
pub enum HttpRequestError {
    #[error("Invalid HTTP request line: {0:?}")]
    MalformedRequestLine(String),
    #[error("No host in request")]
    NoHost,
    #[error("Invalid port: {0:?}")]
    InvalidPort(String),
    #[error("Invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Hostname too long: {0} bytes")]
    HostnameTooLong(usize),
    #[error("Request head exceeds {} bytes", MAX_HEAD_SIZE)]
    HeadTooLarge,
}

impl HttpRequestError {
    pub fn status_message(&self) -> &'static str {
        match self {
            HttpRequestError::NoHost => "Bad Request - No host",
            _ => "Bad Request",
        }
    }
}

/// A fully parsed request head plus whatever body bytes arrived with it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Target as it will be forwarded: origin-form for rewritten absolute URLs.
    pub target: String,
    pub version: String,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub host: String,
    pub port: u16,
    pub is_connect: bool,
}

#[derive(Debug)]
pub enum ParseStatus {
    /// No blank line yet; read more and parse again.
    Incomplete,
    Complete(HttpRequest),
}

/// Parses the bytes received so far.
pub fn parse_request(buf: &[u8]) -> Result<ParseStatus, HttpRequestError> {
    let head_end = match find(buf, HEAD_TERMINATOR) {
        Some(pos) => pos,
        None if buf.len() > MAX_HEAD_SIZE => return Err(HttpRequestError::HeadTooLarge),
        None => return Ok(ParseStatus::Incomplete),
    };
    if head_end > MAX_HEAD_SIZE {
        return Err(HttpRequestError::HeadTooLarge);
    }

    let head = String::from_utf8_lossy(&buf[..head_end]);
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(HttpRequestError::MalformedRequestLine(
            request_line.to_string(),
        ));
    }

    let method = parts[0].to_ascii_uppercase();
    let raw_target = parts[1];
    let version = parts[2].to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some(colon_pos) = line.find(':') {
            if colon_pos == 0 {
                continue;
            }
            let name = line[..colon_pos].trim().to_lowercase();
            let value = line[colon_pos + 1..].trim().to_string();
            headers.insert(name, value);
        }
    }

    let is_connect = method == "CONNECT";
    let (host, port, target) = if is_connect {
        let (host, port) = split_host_port(raw_target, 443)?;
        (host, port, raw_target.to_string())
    } else if has_http_scheme(raw_target) {
        let (host, port, origin) = split_absolute_url(raw_target)?;
        (host, port, origin)
    } else {
        let host_header = headers.get("host").map(String::as_str).unwrap_or_default();
        let (host, port) = split_host_port(host_header, 80)?;
        (host, port, raw_target.to_string())
    };

    if host.is_empty() {
        return Err(HttpRequestError::NoHost);
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(HttpRequestError::HostnameTooLong(host.len()));
    }

    Ok(ParseStatus::Complete(HttpRequest {
        method,
        target,
        version,
        headers,
        body: buf[head_end + HEAD_TERMINATOR.len()..].to_vec(),
        host,
        port,
        is_connect,
    }))
}

impl HttpRequest {
    /// Request head and body as sent upstream. `proxy-*` headers are dropped.
    pub fn to_upstream_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            if name.starts_with("proxy-") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Plain-text error response; the connection is closed after it.
pub fn error_response(code: u16, message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {code} {message}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{message}\r\n"
    )
    .into_bytes()
}

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn has_http_scheme(target: &str) -> bool {
    target
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"))
}

fn split_absolute_url(target: &str) -> Result<(String, u16, String), HttpRequestError> {
    let url = Url::parse(target)?;
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => String::new(),
    };
    let port = url.port_or_known_default().unwrap_or(80);

    let mut origin = url.path().to_string();
    if origin.is_empty() {
        origin.push('/');
    }
    if let Some(query) = url.query() {
        origin.push('?');
        origin.push_str(query);
    }
    Ok((host, port, origin))
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
fn split_host_port(value: &str, default_port: u16) -> Result<(String, u16), HttpRequestError> {
    let value = value.trim();

    if let Some(rest) = value.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| HttpRequestError::InvalidPort(value.to_string()))?;
        let host = &rest[..close];
        let port = match rest[close + 1..].strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match value.split_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((value.to_string(), default_port)),
    }
}

fn parse_port(port: &str) -> Result<u16, HttpRequestError> {
    port.parse::<u16>()
        .map_err(|_| HttpRequestError::InvalidPort(port.to_string()))
}
