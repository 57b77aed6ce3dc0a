//! Buffered stream over any `AsyncRead + AsyncWrite` byte pipe.
//!
//! Both in-tree adapters hand out [`IoStream`]s; pools wrap them in a
//! [`PooledStream`] so the lease slot is freed together with the stream.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{BufferReader, BufferWriter, Stream};

impl BufferWriter for BytesMut {
    fn reserve(&mut self, n: usize) -> std::io::Result<&mut [u8]> {
        let start = self.len();
        self.resize(start + n, 0);
        Ok(&mut self[start..])
    }

    fn write_bytes(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Reads consume the front of the buffer.
#[async_trait]
impl BufferReader for Bytes {
    async fn read_bytes(&mut self, n: usize) -> std::io::Result<Bytes> {
        if n > self.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("need {} bytes, {} remaining", n, self.len()),
            ));
        }
        Ok(self.split_to(n))
    }

    async fn drain(&mut self, limit: usize) -> std::io::Result<usize> {
        let remaining = self.len();
        if remaining > limit {
            return Err(drain_limit_exceeded(limit));
        }
        self.clear();
        Ok(remaining)
    }
}

/// Read half of an [`IoStream`]. Refuses single reads above `max_read`.
#[derive(Debug)]
pub struct IoReader<R> {
    inner: BufReader<R>,
    max_read: usize,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> BufferReader for IoReader<R> {
    async fn read_bytes(&mut self, n: usize) -> std::io::Result<Bytes> {
        if n > self.max_read {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("read of {} bytes exceeds limit of {} bytes", n, self.max_read),
            ));
        }
        let mut buf = BytesMut::zeroed(n);
        self.inner.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }

    async fn drain(&mut self, limit: usize) -> std::io::Result<usize> {
        let bound = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
        let mut rest = (&mut self.inner).take(bound);
        let drained = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
        if drained > limit as u64 {
            return Err(drain_limit_exceeded(limit));
        }
        Ok(drained as usize)
    }
}

fn drain_limit_exceeded(limit: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unread request data exceeds limit of {} bytes", limit),
    )
}

/// A [`Stream`] over a byte pipe: writes accumulate in memory and go out on
/// flush, reads pull from a buffered read half.
#[derive(Debug)]
pub struct IoStream<S> {
    reader: IoReader<ReadHalf<S>>,
    pending: BytesMut,
    write_half: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> IoStream<S> {
    pub fn new(io: S, max_read: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: IoReader {
                inner: BufReader::new(read_half),
                max_read,
            },
            pending: BytesMut::new(),
            write_half,
        }
    }
}

#[async_trait]
impl<S> Stream for IoStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn writer(&mut self) -> &mut dyn BufferWriter {
        &mut self.pending
    }

    fn reader(&mut self) -> &mut dyn BufferReader {
        &mut self.reader
    }

    async fn flush(&mut self, end_of_stream: bool) -> std::io::Result<()> {
        self.write_half.write_all_buf(&mut self.pending).await?;
        self.write_half.flush().await?;
        if end_of_stream {
            self.write_half.shutdown().await?;
        }
        Ok(())
    }
}

/// A stream leased from a bounded pool. Dropping it frees the pool slot.
#[derive(Debug)]
pub struct PooledStream<S> {
    inner: S,
    _permit: OwnedSemaphorePermit,
}

impl<S: Stream> PooledStream<S> {
    pub fn new(inner: S, permit: OwnedSemaphorePermit) -> Self {
        Self {
            inner,
            _permit: permit,
        }
    }
}

#[async_trait]
impl<S: Stream> Stream for PooledStream<S> {
    fn writer(&mut self) -> &mut dyn BufferWriter {
        self.inner.writer()
    }

    fn reader(&mut self) -> &mut dyn BufferReader {
        self.inner.reader()
    }

    async fn flush(&mut self, end_of_stream: bool) -> std::io::Result<()> {
        self.inner.flush(end_of_stream).await
    }
}

/// Wait for a lease slot, bounded by `wait`.
pub(crate) async fn acquire_permit(
    permits: &Arc<Semaphore>,
    wait: Duration,
) -> std::io::Result<OwnedSemaphorePermit> {
    tokio::time::timeout(wait, Arc::clone(permits).acquire_owned())
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for a free stream",
            )
        })?
        .map_err(|_| pool_closed())
}

pub(crate) fn pool_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "stream pool is closed")
}
