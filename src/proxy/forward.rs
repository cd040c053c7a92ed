use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes moved in each direction by [`relay`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copies bytes in both directions until either side closes or fails, then shuts
/// both down. The two directions run concurrently, so a stalled write on one never
/// stops reads on the other; each keeps receive order.
pub async fn relay<C, U>(
    client: &mut C,
    upstream: &mut U,
    buffer_size: usize,
) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = io::split(client);
    let (mut upstream_read, mut upstream_write) = io::split(upstream);
    let mut stats = RelayStats::default();

    let result = {
        let outbound = pump(
            &mut client_read,
            &mut upstream_write,
            buffer_size,
            &mut stats.client_to_upstream,
        );
        let inbound = pump(
            &mut upstream_read,
            &mut client_write,
            buffer_size,
            &mut stats.upstream_to_client,
        );
        tokio::select! {
            res = outbound => res,
            res = inbound => res,
        }
    };

    // No half-open tunnels: the surviving side is closed as well.
    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;

    result.map(|()| stats)
}

/// One direction of the tunnel. Ends with `Ok` on EOF from `reader`.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
