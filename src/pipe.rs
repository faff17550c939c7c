//! Counted bidirectional copying between a local socket and an overlay
//! stream. Used by the SOCKS5 gateway and the TCP forwarders, which share
//! the same accounting convention: `bytes_in` counts data arriving from the
//! overlay toward the local side, `bytes_out` the reverse.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Copy `from` into `to` until EOF or error, bumping `counter` per chunk.
/// Propagates EOF as a write-side shutdown so half-closes travel through.
async fn copy_counted<R, W>(mut from: R, mut to: W, counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }
    to.shutdown().await.ok();
    Ok(total)
}

/// Pipe bytes both ways until both directions have finished.
pub(crate) async fn pipe_streams<L, O>(
    local: L,
    overlay: O,
    bytes_in: &AtomicU64,
    bytes_out: &AtomicU64,
) where
    L: AsyncRead + AsyncWrite + Send + Unpin,
    O: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (overlay_read, overlay_write) = tokio::io::split(overlay);

    let outbound = copy_counted(local_read, overlay_write, bytes_out);
    let inbound = copy_counted(overlay_read, local_write, bytes_in);
    let (outbound, inbound) = futures::join!(outbound, inbound);

    if let Err(e) = outbound {
        debug!("Outbound pipe ended: {}", e);
    }
    if let Err(e) = inbound {
        debug!("Inbound pipe ended: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn counters_track_each_direction() {
        let (local, local_far) = duplex(64);
        let (overlay, overlay_far) = duplex(64);
        let bytes_in = AtomicU64::new(0);
        let bytes_out = AtomicU64::new(0);

        let pump = tokio::spawn(async move {
            let (mut local_far_read, mut local_far_write) = tokio::io::split(local_far);
            let (mut overlay_far_read, mut overlay_far_write) = tokio::io::split(overlay_far);

            // Local client sends 5 bytes out, overlay answers with 7.
            local_far_write.write_all(b"hello").await.unwrap();
            local_far_write.shutdown().await.unwrap();
            let mut got = Vec::new();
            overlay_far_read.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, b"hello");

            overlay_far_write.write_all(b"goodbye").await.unwrap();
            overlay_far_write.shutdown().await.unwrap();
            let mut back = Vec::new();
            local_far_read.read_to_end(&mut back).await.unwrap();
            assert_eq!(back, b"goodbye");
        });

        pipe_streams(local, overlay, &bytes_in, &bytes_out).await;
        pump.await.unwrap();

        assert_eq!(bytes_out.load(Ordering::Relaxed), 5);
        assert_eq!(bytes_in.load(Ordering::Relaxed), 7);
    }
}
