//! RPC client over a stream pool.
//!
//! Each call leases one stream, writes one request frame, flushes, reads one
//! response frame and returns the stream to the pool:
//!
//! ```text
//! call("Svc.M", &args)
//!   ├─ state check ──────────── closing/shut down → Error::Shutdown
//!   ├─ acquire_stream ───────── "can't get stream"
//!   ├─ write_request + flush ── "can't flush request to peer"
//!   ├─ read_response_header ─── Some(text) → Error::Remote(text)
//!   └─ R::decode_from ───────── reply
//! ```

use std::fmt;
use tokio::sync::Mutex;

use crate::codec::{self, Decode, Encode};
use crate::transport::{Connector, Stream, StreamPool};
use crate::types::{ClientConfig, Error, FrameLimits, Result};

#[derive(Debug, Default)]
struct ClientState {
    closing: bool,
    shutdown: bool,
}

/// Synchronous request/response calls over a [`StreamPool`].
///
/// Safe to share between tasks; concurrent calls lease separate streams.
pub struct Client<P: StreamPool> {
    pool: P,
    limits: FrameLimits,
    state: Mutex<ClientState>,
}

impl<P: StreamPool> fmt::Debug for Client<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<P: StreamPool> Client<P> {
    /// Establish the stream pool through `connector` and wrap it.
    pub async fn connect<C>(connector: &C, config: &ClientConfig, limits: FrameLimits) -> Result<Self>
    where
        C: Connector<Pool = P>,
    {
        let pool = tokio::time::timeout(config.initialize_timeout, connector.connect(config, limits))
            .await
            .map_err(|_| {
                Error::transport(
                    "can't create client",
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!(
                            "session manager not ready after {:?}",
                            config.initialize_timeout
                        ),
                    ),
                )
            })?
            .map_err(|e| {
                tracing::error!(address = %config.address, error = %e, "rpc: can't create client");
                Error::transport("can't create client", e)
            })?;

        tracing::info!(
            address = %config.address,
            session_num = config.session_num,
            "rpc client connected"
        );
        Ok(Self::new(pool, limits))
    }

    pub fn new(pool: P, limits: FrameLimits) -> Self {
        Self {
            pool,
            limits,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Invoke `method` (`Service.Method`) with `args` and wait for the reply.
    ///
    /// An error returned by the remote handler comes back as
    /// [`Error::Remote`] carrying the handler's text unchanged.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Encode + Sync + ?Sized,
        R: Decode,
    {
        {
            let state = self.state.lock().await;
            if state.closing || state.shutdown {
                return Err(Error::Shutdown);
            }
        }
        codec::check_method_len(method, &self.limits)?;

        let stream = self
            .pool
            .acquire_stream()
            .await
            .map_err(|e| Error::transport("can't get stream", e))?;
        let mut lease = StreamLease {
            pool: &self.pool,
            stream: Some(stream),
        };
        let stream = lease.stream()?;

        codec::write_request(stream.writer(), method, args, &self.limits)?;
        stream
            .flush(true)
            .await
            .map_err(|e| Error::transport("can't flush request to peer", e))?;

        if let Some(message) = codec::read_response_header(stream.reader(), &self.limits).await? {
            return Err(Error::remote(message));
        }
        R::decode_from(stream.reader())
            .await
            .map_err(|e| Error::transport("can't read reply", e))
    }

    /// Close the pool. Later calls fail with [`Error::Shutdown`]; calls already
    /// in flight are left to finish.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closing || state.shutdown {
            return Err(Error::Shutdown);
        }
        state.closing = true;

        let closed = self.pool.close().await;
        state.shutdown = true;
        closed.map_err(|e| Error::transport("can't close client", e))?;

        tracing::debug!("rpc client closed");
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        let state = self.state.lock().await;
        state.closing || state.shutdown
    }
}

/// A leased stream that goes back to its pool when dropped.
struct StreamLease<'a, P: StreamPool> {
    pool: &'a P,
    stream: Option<P::Stream>,
}

impl<P: StreamPool> StreamLease<'_, P> {
    fn stream(&mut self) -> Result<&mut P::Stream> {
        self.stream.as_mut().ok_or_else(|| {
            Error::transport(
                "can't get stream",
                std::io::Error::new(std::io::ErrorKind::NotConnected, "stream already released"),
            )
        })
    }
}

impl<P: StreamPool> Drop for StreamLease<'_, P> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.release_stream(stream);
        }
    }
}
