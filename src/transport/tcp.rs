//! TCP transport: every leased stream is its own TCP connection, and every
//! server session carries exactly that one stream.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use super::io::{acquire_permit, pool_closed};
use super::{Connector, IoStream, Listener, PooledStream, Session, SessionFactory, StreamPool};
use crate::types::{ClientConfig, FrameLimits};

/// Connector dialing TCP addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Pool = TcpPool;

    async fn connect(&self, config: &ClientConfig, limits: FrameLimits) -> std::io::Result<TcpPool> {
        let addr = tokio::net::lookup_host(config.address.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("address {} did not resolve", config.address),
                )
            })?;

        Ok(TcpPool {
            addr,
            permits: Arc::new(Semaphore::new(config.max_streams)),
            acquire_timeout: config.acquire_timeout,
            connect_timeout: config.initialize_timeout,
            limits,
            closed: AtomicBool::new(false),
        })
    }
}

/// Client-side pool bounding the number of concurrent TCP streams.
#[derive(Debug)]
pub struct TcpPool {
    addr: SocketAddr,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    limits: FrameLimits,
    closed: AtomicBool,
}

#[async_trait]
impl StreamPool for TcpPool {
    type Stream = PooledStream<IoStream<TcpStream>>;

    async fn acquire_stream(&self) -> std::io::Result<Self::Stream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(pool_closed());
        }
        let permit = acquire_permit(&self.permits, self.acquire_timeout).await?;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.addr),
                )
            })??;
        stream.set_nodelay(true)?;

        Ok(PooledStream::new(
            IoStream::new(stream, self.limits.max_payload_len),
            permit,
        ))
    }

    fn release_stream(&self, stream: Self::Stream) {
        drop(stream);
    }

    async fn close(&self) -> std::io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        tracing::debug!(addr = %self.addr, "tcp pool closed");
        Ok(())
    }
}

/// Listener adapter over `tokio::net::TcpListener`.
#[derive(Debug)]
pub struct TcpStreamListener {
    inner: tokio::net::TcpListener,
}

impl TcpStreamListener {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[async_trait]
impl Listener for TcpStreamListener {
    type Connection = TcpStream;

    async fn accept(&mut self) -> std::io::Result<TcpStream> {
        let (stream, peer) = self.inner.accept().await?;
        tracing::trace!(%peer, "tcp connection accepted");
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Session factory for TCP connections.
#[derive(Debug, Clone, Default)]
pub struct TcpSessions {
    limits: FrameLimits,
}

impl TcpSessions {
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl SessionFactory for TcpSessions {
    type Connection = TcpStream;
    type Session = TcpSession;

    async fn server_session(&self, conn: TcpStream) -> std::io::Result<TcpSession> {
        Ok(TcpSession {
            stream: Some(conn),
            limits: self.limits,
        })
    }
}

#[derive(Debug)]
pub struct TcpSession {
    stream: Option<TcpStream>,
    limits: FrameLimits,
}

#[async_trait]
impl Session for TcpSession {
    type Stream = IoStream<TcpStream>;

    async fn accept_stream(&mut self) -> std::io::Result<Self::Stream> {
        let stream = self.stream.take().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "tcp session carries a single stream",
            )
        })?;
        Ok(IoStream::new(stream, self.limits.max_payload_len))
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.stream = None;
        Ok(())
    }
}
