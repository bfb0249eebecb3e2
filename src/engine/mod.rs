//! Outbound proxy engine contract
//!
//! The engine is the component that accepts SOCKS-shaped traffic on a
//! loopback inbound and forwards it, encrypted, to the remote server. The
//! orchestrator only ever sees it through [`ProxyEngine`]; engines are built
//! from a connection link by an [`EngineFactory`].
//!
//! The crate bundles one factory, [`relay::RelayEngineFactory`], covering the
//! `socks://` family. Engines for other protocol families are provided by the
//! embedder through [`crate::config::Config::engine_factory`].

pub mod relay;

pub use relay::RelayEngineFactory;

use crate::config::ProxyAddr;
use crate::link::Link;
use async_trait::async_trait;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol: {0}")]
    Unsupported(String),

    #[error("inbound listener: {0}")]
    Inbound(String),

    #[error("upstream: {0}")]
    Upstream(String),

    #[error("shutdown: {0}")]
    Shutdown(String),
}

/// Log severity understood by outbound engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Unknown,
    None,
}

impl EngineLogLevel {
    /// Derives the engine severity from the active tracing level.
    pub fn from_tracing() -> Self {
        let current = LevelFilter::current();
        if current >= LevelFilter::DEBUG {
            EngineLogLevel::Debug
        } else if current >= LevelFilter::INFO {
            EngineLogLevel::Info
        } else if current >= LevelFilter::WARN {
            EngineLogLevel::Warning
        } else if current >= LevelFilter::ERROR {
            EngineLogLevel::Error
        } else {
            EngineLogLevel::Unknown
        }
    }
}

/// Settings every engine is built with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Loopback address the engine must accept SOCKS connections on.
    pub inbound: ProxyAddr,
    /// Whether to accept self-signed upstream certificates.
    pub tls_allow_insecure: bool,
    /// Severity for the engine's own logging.
    pub log_level: EngineLogLevel,
}

/// A running (or startable) outbound engine.
///
/// `start` may need up to ~100ms after returning before the inbound is ready
/// to accept connections; the orchestrator waits a fixed settle delay.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Brings up the inbound listener and the outbound path.
    async fn start(&self) -> Result<(), EngineError>;

    /// Tears the engine down, closing the inbound listener.
    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds engines from connection links.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Constructs an engine for `link`, configured per `cfg`. The engine is
    /// not started.
    async fn create(
        &self,
        link: &Link,
        cfg: &EngineConfig,
    ) -> Result<Box<dyn ProxyEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_without_subscriber_is_not_none() {
        // No subscriber installed: the static max level is still a filter.
        let level = EngineLogLevel::from_tracing();
        assert_ne!(level, EngineLogLevel::None);
    }
}
