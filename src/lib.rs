//! # shmrpc - Synchronous RPC over pooled bidirectional streams
//!
//! A thin request/response layer on top of a stream transport:
//! - Client calls `Service.Method` with a typed argument and waits for the reply
//! - Server dispatches each incoming stream to a registered handler
//! - One stream carries exactly one request and one response
//! - Transports plug in through the traits in [`transport`]
//!
//! ## Architecture
//!
//! ```text
//!   Client::call ─▶ StreamPool::acquire_stream ─▶ request frame ──┐
//!        ▲                                                        │
//!        └──── response frame ◀─ AwaitingRequest::serve ◀─ Session::accept_stream
//!                                      │
//!                                Registry["Service"].method["Method"]
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let network = MemoryNetwork::new();
//! let registry = Arc::new(Registry::new());
//! registry
//!     .register(ServiceBuilder::new(Echo).method("Ping", |_: Arc<Echo>, b: Bytes| async move {
//!         Ok::<_, String>(b)
//!     }))
//!     .await?;
//!
//! let server = Server::new(registry, MemorySessions::default(), ServerConfig::default(), limits);
//! tokio::spawn({
//!     let server = server.clone();
//!     let listener = network.bind("echo").await?;
//!     async move { server.accept(listener).await }
//! });
//!
//! let client = Client::connect(&network, &ClientConfig { address: "echo".into(), ..Default::default() }, limits).await?;
//! let reply: Bytes = client.call("Echo.Ping", &Bytes::from_static(b"hi")).await?;
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod codec;
pub mod server;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

pub use client::Client;
pub use codec::{Decode, Encode, RequestFrame, ResponseFrame};
pub use server::{Registry, Server, ServiceBuilder};
pub use types::{ClientConfig, Config, Error, FrameLimits, Result, ServerConfig};
