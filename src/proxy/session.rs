use log::debug;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::common::log_sink::LogChannel;
use crate::net::conn::BufferedConnection;
use crate::proxy::forward::{self, RelayStats};
use crate::proxy::http::{self, HttpRequest, HttpRequestError, ParseStatus};
use crate::proxy::socks5::{self, Socks5Error};

/// Protocol phase of a client session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    ConnectingUpstream,
    SocksGreeting,
    SocksConnectRequest,
    Tunneling,
}

/// SOCKS5 server every session connects through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Per-session knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub buffer_size: usize,
    /// Bound on the TCP connect to the SOCKS5 upstream.
    pub connect_timeout: Option<Duration>,
    /// Bound on everything before `Tunneling`. `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            buffer_size: 4096,
            connect_timeout: Some(Duration::from_secs(10)),
            handshake_timeout: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Malformed request: {0}")]
    MalformedRequest(#[from] HttpRequestError),
    #[error("Client closed before sending a complete request")]
    ClientClosed,
    #[error("Failed to connect to SOCKS5 upstream {target}: {source}")]
    UpstreamConnect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("SOCKS5 upstream failed in {state:?}: {source}")]
    Upstream {
        state: SessionState,
        #[source]
        source: io::Error,
    },
    #[error("SOCKS5 handshake failed: {0}")]
    Socks(#[from] Socks5Error),
    #[error("Timed out in {0:?}")]
    HandshakeTimeout(SessionState),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl SessionError {
    /// HTTP status and message for the client, or `None` when nothing should be sent.
    pub fn http_response(&self) -> Option<(u16, String)> {
        let response = match self {
            SessionError::MalformedRequest(e) => (400, e.status_message().to_string()),
            SessionError::UpstreamConnect { .. } | SessionError::Upstream { .. } => {
                (502, "Bad Gateway - SOCKS connection failed".to_string())
            }
            SessionError::Socks(Socks5Error::MethodRejected { .. }) => {
                (502, "Bad Gateway - SOCKS auth failed".to_string())
            }
            SessionError::Socks(Socks5Error::ConnectRejected(code))
            | SessionError::Socks(Socks5Error::InvalidVersion { reply: code, .. }) => (
                502,
                format!("Bad Gateway - SOCKS connect failed (code {})", code),
            ),
            SessionError::Socks(Socks5Error::UnknownAddressType(_)) => {
                (502, "Bad Gateway - Unknown SOCKS address type".to_string())
            }
            SessionError::Socks(Socks5Error::HostnameTooLong(_)) => {
                (400, "Bad Request".to_string())
            }
            SessionError::HandshakeTimeout(SessionState::AwaitingRequest) => {
                (408, "Request Timeout".to_string())
            }
            SessionError::HandshakeTimeout(_) => (504, "Gateway Timeout".to_string()),
            SessionError::ClientClosed | SessionError::IoError(_) => return None,
        };
        Some(response)
    }
}

/// Outcome handed back to the listener when a session ends.
#[derive(Debug)]
pub struct SessionReport {
    pub peer: SocketAddr,
    /// `host:port` the client asked for, once known.
    pub destination: Option<String>,
    pub final_state: SessionState,
    pub outcome: Result<RelayStats, SessionError>,
}

/// One accepted client connection and, once the target is known, its upstream.
///
/// Both sockets are owned here and close together when the session is dropped,
/// whichever way `run` ends (including the task being aborted).
pub struct ClientSession {
    peer: SocketAddr,
    client: BufferedConnection,
    upstream: Option<BufferedConnection>,
    state: SessionState,
    request: Option<HttpRequest>,
    tunnel_established: bool,
    socks: Arc<UpstreamTarget>,
    options: Arc<SessionOptions>,
    log: LogChannel,
}

impl ClientSession {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        socks: Arc<UpstreamTarget>,
        options: Arc<SessionOptions>,
        log: LogChannel,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }
        ClientSession {
            peer,
            client: BufferedConnection::new(stream, options.buffer_size),
            upstream: None,
            state: SessionState::AwaitingRequest,
            request: None,
            tunnel_established: false,
            socks,
            options,
            log,
        }
    }

    pub async fn run(mut self) -> SessionReport {
        let outcome = self.drive().await;

        if let Err(e) = &outcome {
            if !self.tunnel_established {
                if let Some((code, message)) = e.http_response() {
                    let response = http::error_response(code, &message);
                    if self.client.write(&response).await.is_ok() {
                        let _ = self.client.shutdown().await;
                    }
                }
            }
        }

        SessionReport {
            peer: self.peer,
            destination: self
                .request
                .as_ref()
                .map(|r| UpstreamTarget {
                    host: r.host.clone(),
                    port: r.port,
                }
                .to_string()),
            final_state: self.state,
            outcome,
        }
    }

    async fn drive(&mut self) -> Result<RelayStats, SessionError> {
        let upstream = match self.options.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.negotiate()).await {
                Ok(result) => result?,
                Err(_) => return Err(SessionError::HandshakeTimeout(self.state)),
            },
            None => self.negotiate().await?,
        };

        let upstream = self.upstream.insert(upstream);
        self.tunnel_established = true;
        self.state = SessionState::Tunneling;

        if let Some(request) = &self.request {
            if request.is_connect {
                self.client.write(http::CONNECT_ESTABLISHED).await?;
                if !request.body.is_empty() {
                    upstream.write(&request.body).await?;
                }
            } else {
                upstream.write(&request.to_upstream_bytes()).await?;
            }
        }

        let pending = upstream.take_buffered();
        if !pending.is_empty() {
            self.client.write(&pending).await?;
        }

        Ok(forward::relay(&mut self.client, upstream, self.options.buffer_size).await?)
    }

    /// Runs every phase before `Tunneling` and returns the negotiated upstream.
    async fn negotiate(&mut self) -> Result<BufferedConnection, SessionError> {
        let request = self.await_request().await?;
        let (host, port) = (request.host.clone(), request.port);
        self.log.line(format!(
            "{} {} {}:{}",
            self.peer, request.method, host, port
        ));
        self.request = Some(request);

        self.state = SessionState::ConnectingUpstream;
        let mut upstream = BufferedConnection::connect(
            (self.socks.host.as_str(), self.socks.port),
            self.options.connect_timeout,
            self.options.buffer_size,
        )
        .await
        .map_err(|source| SessionError::UpstreamConnect {
            target: self.socks.to_string(),
            source,
        })?;

        self.state = SessionState::SocksGreeting;
        write_upstream(&mut upstream, &socks5::greeting(), self.state).await?;
        loop {
            if let Some(len) = socks5::parse_method_selection(upstream.buffered())? {
                upstream.consume(len);
                break;
            }
            fill_upstream(&mut upstream, self.state).await?;
        }

        self.state = SessionState::SocksConnectRequest;
        write_upstream(&mut upstream, &socks5::connect_request(&host, port)?, self.state).await?;
        loop {
            if let Some(reply) = socks5::parse_connect_reply(upstream.buffered())? {
                debug!(
                    "SOCKS5 tunnel to {}:{} for {} bound at {:?}:{}",
                    host, port, self.peer, reply.bound, reply.port
                );
                upstream.consume(reply.len);
                break;
            }
            fill_upstream(&mut upstream, self.state).await?;
        }

        Ok(upstream)
    }

    async fn await_request(&mut self) -> Result<HttpRequest, SessionError> {
        loop {
            if let ParseStatus::Complete(request) = http::parse_request(self.client.buffered())? {
                // The parsed request carries the body bytes received so far.
                self.client.take_buffered();
                return Ok(request);
            }
            if self.client.fill().await? == 0 {
                return Err(SessionError::ClientClosed);
            }
        }
    }
}

async fn write_upstream(
    upstream: &mut BufferedConnection,
    data: &[u8],
    state: SessionState,
) -> Result<(), SessionError> {
    upstream
        .write(data)
        .await
        .map_err(|source| SessionError::Upstream { state, source })
}

async fn fill_upstream(
    upstream: &mut BufferedConnection,
    state: SessionState,
) -> Result<(), SessionError> {
    match upstream.fill().await {
        Ok(0) => Err(SessionError::Upstream {
            state,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
        }),
        Ok(_) => Ok(()),
        Err(source) => Err(SessionError::Upstream { state, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::log_sink::LogBuffer;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const IPV4_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x30, 0x39];

    struct MockSocks {
        port: u16,
        handle: JoinHandle<(Vec<u8>, TcpStream)>,
    }

    /// Single-shot SOCKS5 server: answers the greeting with `method` and, when that
    /// is no-auth, answers the CONNECT request with `reply`.
    async fn mock_socks(method: u8, reply: Vec<u8>) -> MockSocks {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, method]).await.unwrap();
            if method != 0x00 {
                return (Vec::new(), stream);
            }

            let mut request = vec![0u8; 5];
            stream.read_exact(&mut request).await.unwrap();
            let mut rest = vec![0u8; request[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
            request.extend_from_slice(&rest);

            stream.write_all(&reply).await.unwrap();
            (request, stream)
        });
        MockSocks { port, handle }
    }

    async fn start_session(
        socks_port: u16,
        options: SessionOptions,
    ) -> (TcpStream, JoinHandle<SessionReport>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let (log, _consumer) = LogChannel::spawn(Arc::new(LogBuffer::new())).unwrap();
        let session = ClientSession::new(
            stream,
            peer,
            Arc::new(UpstreamTarget {
                host: "127.0.0.1".to_string(),
                port: socks_port,
            }),
            Arc::new(options),
            log,
        );
        (client, tokio::spawn(session.run()))
    }

    async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        head
    }

    async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connect_tunnel_relays_bytes() {
        let socks = mock_socks(0x00, IPV4_SUCCESS.to_vec()).await;
        let (mut client, session) = start_session(socks.port, SessionOptions::default()).await;

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut established = vec![0u8; http::CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, http::CONNECT_ESTABLISHED);

        let (request, mut upstream) = socks.handle.await.unwrap();
        assert_eq!(request, socks5::connect_request("example.com", 443).unwrap());

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        let report = session.await.unwrap();
        assert_eq!(report.final_state, SessionState::Tunneling);
        assert_eq!(report.destination.as_deref(), Some("example.com:443"));
        let stats = report.outcome.unwrap();
        assert_eq!(stats.client_to_upstream, 5);
        assert_eq!(stats.upstream_to_client, 5);

        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_connect_forwards_early_client_bytes_and_pending_upstream_bytes() {
        let mut reply = IPV4_SUCCESS.to_vec();
        reply.extend_from_slice(b"banner");
        let socks = mock_socks(0x00, reply).await;
        let (mut client, _session) = start_session(socks.port, SessionOptions::default()).await;

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\nearly")
            .await
            .unwrap();

        let mut expected = http::CONNECT_ESTABLISHED.to_vec();
        expected.extend_from_slice(b"banner");
        let mut received = vec![0u8; expected.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let (_, mut upstream) = socks.handle.await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
    }

    #[tokio::test]
    async fn test_plain_request_is_rewritten_and_response_relayed() {
        let socks = mock_socks(0x00, IPV4_SUCCESS.to_vec()).await;
        let (mut client, session) = start_session(socks.port, SessionOptions::default()).await;

        client
            .write_all(
                b"GET http://example.com/path?x=1 HTTP/1.1\r\n\
                  Host: example.com\r\n\
                  Proxy-Connection: keep-alive\r\n\r\n",
            )
            .await
            .unwrap();

        let (request, mut upstream) = socks.handle.await.unwrap();
        assert_eq!(request, socks5::connect_request("example.com", 80).unwrap());

        let head = String::from_utf8(read_head(&mut upstream).await).unwrap();
        assert!(head.starts_with("GET /path?x=1 HTTP/1.1\r\n"));
        assert!(head.contains("host: example.com\r\n"));
        assert!(!head.contains("proxy-connection"));

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        upstream.write_all(response).await.unwrap();
        drop(upstream);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, response);

        let report = session.await.unwrap();
        assert!(report.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_request_never_contacts_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_port = listener.local_addr().unwrap().port();
        let (mut client, session) = start_session(socks_port, SessionOptions::default()).await;

        client.write_all(b"GET /\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(String::from_utf8_lossy(&response).contains("Connection: close\r\n"));

        let report = session.await.unwrap();
        assert!(matches!(
            report.outcome,
            Err(SessionError::MalformedRequest(_))
        ));
        assert_eq!(report.final_state, SessionState::AwaitingRequest);

        let accepted =
            tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn test_missing_host_is_rejected() {
        let (mut client, _session) =
            start_session(refused_port().await, SessionOptions::default()).await;

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request - No host\r\n"));
    }

    #[tokio::test]
    async fn test_refused_upstream_is_bad_gateway() {
        let (mut client, session) =
            start_session(refused_port().await, SessionOptions::default()).await;

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway"));

        let report = session.await.unwrap();
        assert!(matches!(
            report.outcome,
            Err(SessionError::UpstreamConnect { .. })
        ));
        assert_eq!(report.final_state, SessionState::ConnectingUpstream);
    }

    #[tokio::test]
    async fn test_rejected_auth_method() {
        let socks = mock_socks(0xFF, Vec::new()).await;
        let (mut client, _session) = start_session(socks.port, SessionOptions::default()).await;

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway - SOCKS auth failed\r\n"));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_code() {
        let socks = mock_socks(0x00, vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await;
        let (mut client, session) = start_session(socks.port, SessionOptions::default()).await;

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response
            .starts_with(b"HTTP/1.1 502 Bad Gateway - SOCKS connect failed (code 5)\r\n"));

        let report = session.await.unwrap();
        assert!(matches!(
            report.outcome,
            Err(SessionError::Socks(Socks5Error::ConnectRejected(5)))
        ));
    }

    #[tokio::test]
    async fn test_wrong_reply_version_reports_code() {
        let socks = mock_socks(0x00, vec![0x04, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await;
        let (mut client, session) = start_session(socks.port, SessionOptions::default()).await;

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response
            .starts_with(b"HTTP/1.1 502 Bad Gateway - SOCKS connect failed (code 3)\r\n"));

        let report = session.await.unwrap();
        assert!(matches!(
            report.outcome,
            Err(SessionError::Socks(Socks5Error::InvalidVersion {
                version: 0x04,
                reply: 0x03
            }))
        ));
    }

    #[tokio::test]
    async fn test_unknown_address_type_does_not_hang() {
        let socks = mock_socks(0x00, vec![0x05, 0x00, 0x00, 0x09]).await;
        let (mut client, _session) = start_session(socks.port, SessionOptions::default()).await;

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway - Unknown SOCKS address type"));

        // The mock keeps its end open; the session must not wait for it.
        let (_, _upstream) = socks.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_client_hits_handshake_timeout() {
        let options = SessionOptions {
            handshake_timeout: Some(Duration::from_millis(200)),
            ..SessionOptions::default()
        };
        let (mut client, session) = start_session(refused_port().await, options).await;

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 408 Request Timeout\r\n"));

        let report = session.await.unwrap();
        assert!(matches!(
            report.outcome,
            Err(SessionError::HandshakeTimeout(SessionState::AwaitingRequest))
        ));
    }

    #[tokio::test]
    async fn test_client_closing_early() {
        let (mut client, session) =
            start_session(refused_port().await, SessionOptions::default()).await;

        client.write_all(b"GET http://exa").await.unwrap();
        drop(client);

        let report = session.await.unwrap();
        assert!(matches!(report.outcome, Err(SessionError::ClientClosed)));
        assert!(report.destination.is_none());
    }

    #[test]
    fn test_upstream_target_display() {
        let v4 = UpstreamTarget {
            host: "127.0.0.1".to_string(),
            port: 1080,
        };
        assert_eq!(v4.to_string(), "127.0.0.1:1080");

        let v6 = UpstreamTarget {
            host: "::1".to_string(),
            port: 1080,
        };
        assert_eq!(v6.to_string(), "[::1]:1080");
    }
}
