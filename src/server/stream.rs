//! Per-stream request/response state machine.
//!
//! ```text
//!   AwaitingRequest ──serve()──▶ ResponseSent
//! ```
//! `serve` takes the stream by value and `ResponseSent` does not hand it back,
//! so a second exchange on the same stream cannot be written.
//!
//! The request is read up to the client's end of stream before any response
//! bytes go out. Whatever the header read, lookup or handler left unread is
//! discarded, bounded by `FrameLimits::max_payload_len`.

use crate::codec;
use crate::server::registry::{Outcome, Registry};
use crate::transport::{BufferReader, Stream};
use crate::types::{Error, FrameLimits, Result};

/// A freshly accepted stream whose request has not been read yet.
#[derive(Debug)]
pub struct AwaitingRequest<S> {
    stream: S,
    limits: FrameLimits,
}

/// Proof that exactly one response frame was written and flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ResponseSent {
    /// Method identifier from the request, when it could be read.
    pub method: Option<String>,
    /// Error text sent instead of a reply, if any.
    pub error: Option<String>,
}

impl<S: Stream> AwaitingRequest<S> {
    pub fn new(stream: S, limits: FrameLimits) -> Self {
        Self { stream, limits }
    }

    /// Read one request, dispatch it through `registry` and answer it.
    ///
    /// Lookup and argument decode failures are answered with an error frame.
    /// `Err` is returned only for transport failures, in which case no
    /// response was delivered.
    pub async fn serve(mut self, registry: &Registry) -> Result<ResponseSent> {
        let header = codec::read_request_header(self.stream.reader(), &self.limits).await;
        let method = match header {
            Ok(method) => method,
            Err(e @ Error::Protocol(_)) => {
                return self.respond(None, Outcome::Failed(e.to_string())).await;
            }
            Err(e) => return Err(e),
        };

        let outcome = match self.dispatch(registry, &method).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(e.to_string()),
        };
        self.respond(Some(method), outcome).await
    }

    async fn dispatch(&mut self, registry: &Registry, identifier: &str) -> Result<Outcome> {
        let (service, method_name) = registry.resolve(identifier).await?;
        let method = service.method(method_name).ok_or_else(|| {
            Error::protocol(format!("rpc: can't find method {}", identifier))
        })?;
        method.invoke(self.stream.reader()).await
    }

    async fn respond(mut self, method: Option<String>, outcome: Outcome) -> Result<ResponseSent> {
        let unread = self
            .stream
            .reader()
            .drain(self.limits.max_payload_len)
            .await
            .map_err(|e| Error::transport("can't drain request", e))?;
        if unread > 0 {
            tracing::debug!(
                method = method.as_deref().unwrap_or(""),
                unread,
                "discarded unread request bytes"
            );
        }

        let error = match outcome {
            Outcome::Reply(reply) => {
                codec::write_reply(self.stream.writer(), reply.as_ref())
                    .map_err(|e| Error::transport("can't write reply", e))?;
                None
            }
            Outcome::Failed(message) => {
                codec::write_error(self.stream.writer(), &message, &self.limits)
                    .map_err(|e| Error::transport("can't write error message", e))?;
                Some(message)
            }
        };

        self.stream
            .flush(true)
            .await
            .map_err(|e| Error::transport("can't flush response to peer", e))?;

        Ok(ResponseSent { method, error })
    }
}
