//! RPC server: accept loop, per-connection session loop, per-stream dispatch.
//!
//! ```text
//! Listener::accept ──▶ connection task ──▶ Session::accept_stream ──▶ stream task
//!   (max_connections,                        (max_concurrent_streams,   AwaitingRequest::serve
//!    excess closed at once)                   excess waits)
//! ```

pub mod registry;
mod stream;

pub use registry::{Method, Registry, Service, ServiceBuilder};
pub use stream::{AwaitingRequest, ResponseSent};

use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::transport::{Listener, Session, SessionFactory, Stream};
use crate::types::{Error, FrameLimits, Result, ServerConfig};

/// Serves a [`Registry`] over connections produced by a [`Listener`].
///
/// Cheap to clone; clones share the registry, the concurrency bounds and the
/// shutdown token.
pub struct Server<F: SessionFactory> {
    inner: Arc<Inner<F>>,
}

struct Inner<F> {
    registry: Arc<Registry>,
    sessions: F,
    config: ServerConfig,
    limits: FrameLimits,
    connection_permits: Arc<Semaphore>,
    stream_permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<F: SessionFactory> Clone for Server<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: SessionFactory> fmt::Debug for Server<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("limits", &self.inner.limits)
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<F: SessionFactory> Server<F> {
    pub fn new(
        registry: Arc<Registry>,
        sessions: F,
        config: ServerConfig,
        limits: FrameLimits,
    ) -> Self {
        let connection_permits = Arc::new(Semaphore::new(config.max_connections.max(1)));
        let stream_permits = Arc::new(Semaphore::new(config.max_concurrent_streams.max(1)));
        Self {
            inner: Arc::new(Inner {
                registry,
                sessions,
                config,
                limits,
                connection_permits,
                stream_permits,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Accept connections until the listener fails or [`Server::shutdown`]
    /// is called. Each connection is served on its own task.
    ///
    /// Connections beyond `max_connections` are closed as soon as they are
    /// accepted. A listener error is logged and returned; connections already
    /// being served keep running.
    pub async fn accept<L>(&self, mut listener: L) -> Result<()>
    where
        L: Listener<Connection = F::Connection>,
    {
        tracing::info!(
            max_connections = self.inner.config.max_connections,
            max_concurrent_streams = self.inner.config.max_concurrent_streams,
            "rpc server accepting connections"
        );

        loop {
            let conn = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "rpc.Serve: accept");
                        return Err(Error::Io(e));
                    }
                },
            };

            // At capacity: close at once, the peer sees its session reset.
            let permit = match Arc::clone(&self.inner.connection_permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(
                        max_connections = self.inner.config.max_connections,
                        "rpc connection rejected: at max_connections"
                    );
                    drop(conn);
                    continue;
                }
            };

            tracing::debug!(
                active = self
                    .inner
                    .config
                    .max_connections
                    .saturating_sub(self.inner.connection_permits.available_permits()),
                "rpc connection accepted"
            );
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_connection(conn).await;
                drop(permit);
            });
        }

        tracing::info!("rpc server shutting down");
        Ok(())
    }

    /// Open a session on `conn` and dispatch each of its streams on its own
    /// task until the peer goes away.
    pub async fn serve_connection(&self, conn: F::Connection) {
        let mut session = match self.inner.sessions.server_session(conn).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "rpc: can't open server session");
                return;
            }
        };

        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = session.accept_stream() => accepted,
            };
            let stream = match accepted {
                Ok(stream) => stream,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("rpc session ended by peer");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "rpc: can't accept stream");
                    break;
                }
            };

            let permit = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                permit = Arc::clone(&self.inner.stream_permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_stream(stream).await;
                drop(permit);
            });
        }

        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "rpc session close failed");
        }
    }

    /// Serve exactly one request/response exchange on `stream`.
    pub async fn serve_stream<S: Stream>(&self, stream: S) {
        let served = AwaitingRequest::new(stream, self.inner.limits)
            .serve(&self.inner.registry)
            .await;
        match served {
            Ok(ResponseSent {
                method,
                error: None,
            }) => {
                tracing::trace!(method = method.as_deref().unwrap_or(""), "rpc call served");
            }
            Ok(ResponseSent {
                method,
                error: Some(error),
            }) => {
                tracing::debug!(
                    method = method.as_deref().unwrap_or(""),
                    error = %error,
                    "rpc call answered with error"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, code = e.code(), "rpc stream aborted");
            }
        }
    }

    /// Stop accepting connections and streams. In-flight calls finish.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}
