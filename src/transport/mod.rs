//! Transport adapter seam.
//!
//! The RPC layer never touches sockets or shared memory directly. It consumes
//! pooled, bidirectional streams through the traits below:
//!
//! ```text
//!  client side                         server side
//!  ───────────                         ───────────
//!  Connector ──connect──▶ StreamPool    Listener ──accept──▶ Connection
//!                          │                                    │
//!              acquire/release                    SessionFactory::server_session
//!                          ▼                                    ▼
//!                        Stream  ◀════ one exchange ════▶  Session::accept_stream
//! ```
//!
//! Two adapters ship in-tree: [`memory`] (in-process pipes) and [`tcp`]
//! (one TCP connection per stream). A shared-memory engine plugs in by
//! implementing the same traits.

pub mod io;
pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::{ClientConfig, FrameLimits};

pub use io::{IoStream, PooledStream};

/// Write side of a stream. Writes are buffered until [`Stream::flush`].
pub trait BufferWriter: Send {
    /// Reserve `n` zeroed bytes at the end of the buffer and return them for
    /// in-place writes (length prefixes).
    fn reserve(&mut self, n: usize) -> std::io::Result<&mut [u8]>;

    /// Append `data` to the buffer.
    fn write_bytes(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Append the UTF-8 bytes of `s`.
    fn write_str(&mut self, s: &str) -> std::io::Result<()> {
        self.write_bytes(s.as_bytes())
    }
}

/// Read side of a stream.
#[async_trait]
pub trait BufferReader: Send {
    /// Read exactly `n` bytes, waiting for the peer as needed.
    async fn read_bytes(&mut self, n: usize) -> std::io::Result<Bytes>;

    /// Discard everything up to the peer's end of stream and return how many
    /// bytes were dropped. Fails with `InvalidData` once more than `limit`
    /// bytes remain.
    async fn drain(&mut self, limit: usize) -> std::io::Result<usize>;
}

/// A leased, exclusive bidirectional channel carrying one exchange.
#[async_trait]
pub trait Stream: Send + 'static {
    fn writer(&mut self) -> &mut dyn BufferWriter;

    fn reader(&mut self) -> &mut dyn BufferReader;

    /// Send everything buffered so far. With `end_of_stream` the write side is
    /// closed afterwards.
    async fn flush(&mut self, end_of_stream: bool) -> std::io::Result<()>;
}

/// Client-side pool of streams (the session manager).
#[async_trait]
pub trait StreamPool: Send + Sync + 'static {
    type Stream: Stream;

    /// Lease a stream. Blocks while the pool is exhausted, up to the pool's
    /// acquire timeout.
    async fn acquire_stream(&self) -> std::io::Result<Self::Stream>;

    /// Return a leased stream to the pool.
    fn release_stream(&self, stream: Self::Stream);

    /// Release every session held by the pool.
    async fn close(&self) -> std::io::Result<()>;
}

/// Builds a [`StreamPool`] from client configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    type Pool: StreamPool;

    async fn connect(&self, config: &ClientConfig, limits: FrameLimits)
        -> std::io::Result<Self::Pool>;
}

/// Source of raw server-side connections.
#[async_trait]
pub trait Listener: Send + 'static {
    type Connection: Send + 'static;

    async fn accept(&mut self) -> std::io::Result<Self::Connection>;
}

/// Wraps a raw connection into a server session.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Session: Session;

    async fn server_session(&self, conn: Self::Connection) -> std::io::Result<Self::Session>;
}

/// Server-side session multiplexing many streams over one connection.
///
/// `accept_stream` returns `ErrorKind::UnexpectedEof` once the peer has gone
/// away cleanly.
#[async_trait]
pub trait Session: Send + 'static {
    type Stream: Stream;

    async fn accept_stream(&mut self) -> std::io::Result<Self::Stream>;

    async fn close(&mut self) -> std::io::Result<()>;
}
