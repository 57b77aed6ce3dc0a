//! In-process transport.
//!
//! A [`MemoryNetwork`] maps addresses to listeners. Connecting opens
//! `session_num` sessions to the listener; every leased stream is a fresh
//! `tokio::io::duplex` pipe whose far end is handed to the session on the
//! server side.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};

use super::io::{acquire_permit, pool_closed};
use super::{Connector, IoStream, Listener, PooledStream, Session, SessionFactory, StreamPool};
use crate::types::{ClientConfig, FrameLimits};

type Incoming = mpsc::UnboundedSender<MemoryConnection>;

/// Registry of in-process listeners keyed by address.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, Incoming>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening on `address`.
    pub async fn bind(&self, address: &str) -> std::io::Result<MemoryListener> {
        let mut listeners = self.listeners.lock().await;
        if listeners.get(address).is_some_and(|tx| !tx.is_closed()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("address already in use: {}", address),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(address.to_string(), tx);
        tracing::debug!(address, "memory listener bound");
        Ok(MemoryListener {
            address: address.to_string(),
            incoming: rx,
        })
    }

    /// Stop listening on `address`. The listener's pending `accept` fails.
    pub async fn unbind(&self, address: &str) -> bool {
        self.listeners.lock().await.remove(address).is_some()
    }

    async fn dial(&self, address: &str) -> std::io::Result<Incoming> {
        self.listeners
            .lock()
            .await
            .get(address)
            .filter(|tx| !tx.is_closed())
            .cloned()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("no listener at {}", address),
                )
            })
    }
}

/// Accepts in-process connections for one address.
#[derive(Debug)]
pub struct MemoryListener {
    address: String,
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl MemoryListener {
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Listener for MemoryListener {
    type Connection = MemoryConnection;

    async fn accept(&mut self) -> std::io::Result<MemoryConnection> {
        self.incoming.recv().await.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                format!("listener {} closed", self.address),
            )
        })
    }
}

/// Raw in-process connection: the receiving end of a client session.
#[derive(Debug)]
pub struct MemoryConnection {
    streams: mpsc::UnboundedReceiver<DuplexStream>,
}

/// Server-side session factory for [`MemoryConnection`]s.
#[derive(Debug, Clone, Default)]
pub struct MemorySessions {
    limits: FrameLimits,
}

impl MemorySessions {
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl SessionFactory for MemorySessions {
    type Connection = MemoryConnection;
    type Session = MemorySession;

    async fn server_session(&self, conn: MemoryConnection) -> std::io::Result<MemorySession> {
        Ok(MemorySession {
            streams: conn.streams,
            limits: self.limits,
        })
    }
}

#[derive(Debug)]
pub struct MemorySession {
    streams: mpsc::UnboundedReceiver<DuplexStream>,
    limits: FrameLimits,
}

#[async_trait]
impl Session for MemorySession {
    type Stream = IoStream<DuplexStream>;

    async fn accept_stream(&mut self) -> std::io::Result<Self::Stream> {
        let pipe = self.streams.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "session closed by peer")
        })?;
        Ok(IoStream::new(pipe, self.limits.max_payload_len))
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.streams.close();
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    type Pool = MemoryPool;

    async fn connect(
        &self,
        config: &ClientConfig,
        limits: FrameLimits,
    ) -> std::io::Result<MemoryPool> {
        let incoming = self.dial(&config.address).await?;

        let mut sessions = Vec::with_capacity(config.session_num);
        for _ in 0..config.session_num.max(1) {
            let (tx, rx) = mpsc::unbounded_channel();
            incoming
                .send(MemoryConnection { streams: rx })
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        format!("listener {} closed", config.address),
                    )
                })?;
            sessions.push(tx);
        }

        Ok(MemoryPool {
            sessions: RwLock::new(sessions),
            next: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(config.max_streams)),
            acquire_timeout: config.acquire_timeout,
            buffer_size: config.buffer_size.max(1),
            limits,
        })
    }
}

/// Client-side pool of in-process streams, spread round-robin over sessions.
#[derive(Debug)]
pub struct MemoryPool {
    sessions: RwLock<Vec<mpsc::UnboundedSender<DuplexStream>>>,
    next: AtomicUsize,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    buffer_size: usize,
    limits: FrameLimits,
}

#[async_trait]
impl StreamPool for MemoryPool {
    type Stream = PooledStream<IoStream<DuplexStream>>;

    async fn acquire_stream(&self) -> std::io::Result<Self::Stream> {
        let permit = acquire_permit(&self.permits, self.acquire_timeout).await?;

        let sessions = self.sessions.read().await;
        if sessions.is_empty() {
            return Err(pool_closed());
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % sessions.len();

        let (local, remote) = tokio::io::duplex(self.buffer_size);
        sessions[index].send(remote).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "session closed by peer")
        })?;

        Ok(PooledStream::new(
            IoStream::new(local, self.limits.max_payload_len),
            permit,
        ))
    }

    fn release_stream(&self, stream: Self::Stream) {
        // Pipes carry a single exchange; dropping frees the lease slot.
        drop(stream);
    }

    async fn close(&self) -> std::io::Result<()> {
        self.permits.close();
        self.sessions.write().await.clear();
        tracing::debug!("memory pool closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BufferReader, BufferWriter, Stream};

    fn client_config(address: &str) -> ClientConfig {
        ClientConfig {
            address: address.to_string(),
            session_num: 2,
            max_streams: 1,
            acquire_timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn bind_twice_is_rejected() {
        let network = MemoryNetwork::new();
        let _listener = network.bind("svc").await.unwrap();
        let err = network.bind("svc").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn connect_without_listener_is_refused() {
        let network = MemoryNetwork::new();
        let err = network
            .connect(&client_config("nowhere"), FrameLimits::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn connect_opens_one_connection_per_session() {
        let network = MemoryNetwork::new();
        let mut listener = network.bind("svc").await.unwrap();
        let _pool = network
            .connect(&client_config("svc"), FrameLimits::default())
            .await
            .unwrap();

        listener.accept().await.unwrap();
        listener.accept().await.unwrap();
        assert!(listener.incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_then_recovers_on_release() {
        let network = MemoryNetwork::new();
        let _listener = network.bind("svc").await.unwrap();
        let pool = network
            .connect(&client_config("svc"), FrameLimits::default())
            .await
            .unwrap();

        let held = pool.acquire_stream().await.unwrap();
        let err = pool.acquire_stream().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        pool.release_stream(held);
        pool.acquire_stream().await.unwrap();
    }

    #[tokio::test]
    async fn closed_pool_refuses_streams_and_ends_sessions() {
        let network = MemoryNetwork::new();
        let mut listener = network.bind("svc").await.unwrap();
        let pool = network
            .connect(&client_config("svc"), FrameLimits::default())
            .await
            .unwrap();
        let conn = listener.accept().await.unwrap();
        let mut session = MemorySessions::default().server_session(conn).await.unwrap();

        pool.close().await.unwrap();

        let err = pool.acquire_stream().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
        let err = session.accept_stream().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn leased_stream_reaches_server_session() {
        let network = MemoryNetwork::new();
        let mut listener = network.bind("svc").await.unwrap();
        let pool = network
            .connect(
                &ClientConfig {
                    session_num: 1,
                    ..client_config("svc")
                },
                FrameLimits::default(),
            )
            .await
            .unwrap();
        let conn = listener.accept().await.unwrap();
        let mut session = MemorySessions::default().server_session(conn).await.unwrap();

        let mut stream = pool.acquire_stream().await.unwrap();
        stream.writer().write_bytes(b"hi").unwrap();
        stream.flush(false).await.unwrap();

        let mut served = session.accept_stream().await.unwrap();
        assert_eq!(&served.reader().read_bytes(2).await.unwrap()[..], b"hi");
    }
}
