//! Core types shared by the client and the server.
//!
//! - **Errors**: the call error taxonomy with thiserror derives
//! - **Config**: client, server, frame-limit and logging configuration

mod config;
mod errors;

pub use config::{ClientConfig, Config, FrameLimits, ObservabilityConfig, ServerConfig};
pub use errors::{Error, Result};
