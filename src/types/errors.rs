//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Messages
//! that cross the wire (protocol and remote errors) are carried verbatim so the
//! text a client sees is exactly what the server wrote into the frame.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the RPC layer.
#[derive(Error, Debug)]
pub enum Error {
    /// The client is closing or already closed. Returned without touching the
    /// transport.
    #[error("connection is shut down")]
    Shutdown,

    /// Stream acquisition or stream I/O failed. `context` names the call stage.
    #[error("rpc: {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Malformed method identifier, unknown service or method, bad argument
    /// payload, or a length prefix over the configured limit.
    #[error("{0}")]
    Protocol(String),

    /// Error text returned by the remote handler, verbatim.
    #[error("{0}")]
    Remote(String),

    /// Service registration rejected.
    #[error("{0}")]
    Registration(String),

    /// Invalid configuration values.
    #[error("config error: {0}")]
    Config(String),

    /// Configuration (de)serialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors outside a call (listener, config files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable upper-case code used in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Shutdown => "SHUTDOWN",
            Error::Transport { .. } => "TRANSPORT",
            Error::Protocol(_) => "PROTOCOL",
            Error::Remote(_) => "REMOTE",
            Error::Registration(_) => "REGISTRATION",
            Error::Config(_) => "INVALID_CONFIG",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }

    /// True when the error text came from the remote side of the call.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_))
    }
}

// Convenience constructors
impl Error {
    pub fn transport(context: &'static str, source: std::io::Error) -> Self {
        Self::Transport { context, source }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
