//! Observability utilities.

use std::sync::OnceLock;
use tracing::Subscriber;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `SHMRPC_LOG_FORMAT=json`. Filter defaults to `info` if `RUST_LOG` is unset.
pub fn init_tracing() {
    let json = std::env::var("SHMRPC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    install("info", json);
}

/// Like [`init_tracing`], but level and format come from configuration.
/// `RUST_LOG` still wins over `config.log_level` when set.
pub fn init_tracing_with(config: &ObservabilityConfig) {
    install(&config.log_level, config.json_logs);
}

fn install(default_level: &str, json: bool) {
    TRACING_INIT.get_or_init(|| {
        let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
        if let Err(err) = subscriber(default_level, json, directives.as_deref()).try_init() {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

/// `directives` (from `RUST_LOG`) when they parse, otherwise `default_level`,
/// otherwise `info`.
fn filter(default_level: &str, directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .or_else(|| EnvFilter::try_new(default_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn subscriber(
    default_level: &str,
    json: bool,
    directives: Option<&str>,
) -> Box<dyn Subscriber + Send + Sync> {
    let registry = tracing_subscriber::registry().with(filter(default_level, directives));
    if json {
        Box::new(registry.with(fmt::layer().json()))
    } else {
        Box::new(registry.with(fmt::layer().compact()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing_with(&ObservabilityConfig::default());
        init_tracing();
    }

    #[test]
    fn configured_level_is_honoured() {
        tracing::subscriber::with_default(subscriber("warn", false, None), || {
            assert!(tracing::enabled!(Level::WARN));
            assert!(tracing::enabled!(Level::ERROR));
            assert!(!tracing::enabled!(Level::INFO));
            assert!(!tracing::enabled!(Level::DEBUG));
        });

        tracing::subscriber::with_default(subscriber("trace", true, None), || {
            assert!(tracing::enabled!(Level::TRACE));
        });
    }

    #[test]
    fn env_directives_override_configured_level() {
        tracing::subscriber::with_default(subscriber("error", false, Some("debug")), || {
            assert!(tracing::enabled!(Level::DEBUG));
            assert!(!tracing::enabled!(Level::TRACE));
        });
    }

    #[test]
    fn unparsable_env_directives_fall_back_to_configured_level() {
        tracing::subscriber::with_default(subscriber("error", false, Some("shmrpc=loud")), || {
            assert!(tracing::enabled!(Level::ERROR));
            assert!(!tracing::enabled!(Level::WARN));
        });
    }
}
