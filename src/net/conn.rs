use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, ToSocketAddrs};

/// TCP stream with an accumulating read buffer.
///
/// Protocol phases inspect the accumulated bytes with [`buffered`](Self::buffered)
/// and drop what they parsed with [`consume`](Self::consume).
pub struct BufferedConnection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
    temp_buffer: Vec<u8>,
}

impl BufferedConnection {
    pub fn new(stream: TcpStream, buffer_size: usize) -> Self {
        BufferedConnection {
            stream,
            read_buffer: Vec::with_capacity(buffer_size),
            temp_buffer: vec![0u8; buffer_size.max(1)],
        }
    }

    /// Connects to `addr`, bounded by `timeout` when one is given.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        timeout: Option<Duration>,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, buffer_size))
    }

    /// Reads once from the socket and appends to the buffer. Returns 0 on EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let n = self.stream.read(&mut self.temp_buffer).await?;
        if n > 0 {
            self.read_buffer.extend_from_slice(&self.temp_buffer[..n]);
        }
        Ok(n)
    }

    pub fn buffered(&self) -> &[u8] {
        &self.read_buffer
    }

    pub fn consume(&mut self, len: usize) {
        let len = len.min(self.read_buffer.len());
        self.read_buffer.drain(..len);
    }

    /// Removes and returns everything buffered so far.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_buffer)
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }
}

/// Residual data in the read buffer is drained first before delegating to
/// the underlying stream, so bytes read ahead during negotiation reach the relay.
impl AsyncRead for BufferedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_buffer.is_empty() {
            let to_copy = std::cmp::min(this.read_buffer.len(), buf.remaining());
            buf.put_slice(&this.read_buffer[..to_copy]);
            this.read_buffer.drain(..to_copy);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for BufferedConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
