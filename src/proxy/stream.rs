//! Bidirectional byte relay used by CONNECT tunnels
//!
//! Each direction copies through its own pooled buffer. The client→target
//! direction is the primary one: [`StreamCopier::relay`] returns as soon as it
//! finishes, while target→client keeps draining on a detached task. A
//! direction only ends on EOF or an IO error; closing an endpoint is the way
//! to stop one.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use crate::proxy::pool::BufferPool;

/// What a write side supports, decided once when the session is set up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Flush after every write; needed where the transport would otherwise buffer
    pub flush_each_write: bool,
    /// Signal end-of-stream with a write-side shutdown when the copy ends
    pub half_close: bool,
}

impl Capabilities {
    /// A raw socket: no explicit flushing, shutdown half-closes
    pub const RAW: Capabilities = Capabilities {
        flush_each_write: false,
        half_close: true,
    };

    /// A multiplexed stream whose writes sit in a send buffer until flushed
    pub const FLUSHING: Capabilities = Capabilities {
        flush_each_write: true,
        half_close: true,
    };
}

/// A duplex IO object plus the capabilities of its write side
pub struct Endpoint<T> {
    pub io: T,
    pub caps: Capabilities,
}

impl<T> Endpoint<T> {
    pub fn new(io: T, caps: Capabilities) -> Self {
        Self { io, caps }
    }
}

/// Result of a relay; the reverse direction may still be running
pub struct RelayOutcome {
    /// Bytes copied client→target, or the error that ended that direction
    pub client_to_target: io::Result<u64>,
    /// Detached target→client copy; dropping the handle does not stop it
    pub target_to_client: JoinHandle<io::Result<u64>>,
}

/// Copies bytes between two endpoints using pooled buffers
#[derive(Clone)]
pub struct StreamCopier {
    pool: BufferPool,
}

impl StreamCopier {
    pub fn new(pool: BufferPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Copy client→target and target→client concurrently
    ///
    /// Returns once client→target has finished. Both endpoints are dropped,
    /// and therefore closed, when the last direction lets go of them.
    #[instrument(skip_all)]
    pub async fn relay<C, T>(&self, client: Endpoint<C>, target: Endpoint<T>) -> RelayOutcome
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client.io);
        let (mut target_read, mut target_write) = tokio::io::split(target.io);

        let pool = self.pool.clone();
        let client_caps = client.caps;

        let target_to_client = tokio::spawn(async move {
            let result = copy_stream(&pool, &mut target_read, &mut client_write, client_caps).await;
            trace!(?result, "target->client finished");
            result
        });

        let client_to_target =
            copy_stream(&self.pool, &mut client_read, &mut target_write, target.caps).await;

        if let Err(e) = &client_to_target {
            debug!("client->target ended: {}", e);
        }

        RelayOutcome {
            client_to_target,
            target_to_client,
        }
    }

    /// Copy one direction until EOF or error
    pub async fn copy<R, W>(&self, reader: &mut R, writer: &mut W, caps: Capabilities) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        copy_stream(&self.pool, reader, writer, caps).await
    }
}

/// Buffered copy loop; the lease is released on every exit path
async fn copy_stream<R, W>(
    pool: &BufferPool,
    reader: &mut R,
    writer: &mut W,
    caps: Capabilities,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let result = {
        let mut buf = pool.lease();
        copy_with_buffer(reader, writer, &mut buf, caps.flush_each_write).await
    };

    if caps.half_close {
        let _ = writer.shutdown().await;
    }

    result
}

async fn copy_with_buffer<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    flush_each_write: bool,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            break;
        }

        // write_all reports a zero-length write as WriteZero, which ends the direction
        writer.write_all(&buf[..n]).await?;
        if flush_each_write {
            writer.flush().await?;
        }
        written += n as u64;
    }

    if !flush_each_write {
        writer.flush().await?;
    }
    Ok(written)
}
