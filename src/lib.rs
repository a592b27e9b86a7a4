//! Portico - multi-tenant MCP credential gateway
//!
//! Portico sits between MCP clients and external OAuth-protected
//! services. Each connected instance (one tenant's account on one
//! service) gets its credentials cached, refreshed before expiry by a
//! background watcher, and attached to proxied requests by middleware,
//! with one reusable protocol handler per instance.
//!
//! The [`engine::Engine`] owns the whole subsystem; there is no global
//! state. Embedders construct an engine from a [`config::Config`] and a
//! handler factory:
//!
//! ```rust,no_run
//! use portico::config::Config;
//! use portico::engine::Engine;
//! use portico::sessions::HttpProxyHandler;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_or_default()?;
//!     let engine = std::sync::Arc::new(
//!         Engine::new(config.clone(), HttpProxyHandler::factory()).await?,
//!     );
//!     portico::http::serve(config, engine).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod model;

pub mod cache;
pub mod config;
pub mod refresh;
pub mod sessions;
pub mod storage;
pub mod watcher;

pub mod auth;
pub mod engine;

pub mod cli;
pub mod http;

pub mod utils;

pub use error::{GatewayError, RefreshError, Result, StorageError};

/// Initialize structured logging to stderr.
///
/// `RUST_LOG` wins; otherwise the configured level, then `portico=info`.
pub fn init_logging(config_level: Option<&str>) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Filter used when `RUST_LOG` is unset
fn default_filter(config_level: Option<&str>) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(config_level.unwrap_or("portico=info"))
}

#[cfg(test)]
mod logging_test {
    use super::default_filter;

    #[test]
    fn test_default_filter_prefers_configured_level() {
        assert_eq!(default_filter(Some("portico=debug")).to_string(), "portico=debug");
        assert_eq!(default_filter(None).to_string(), "portico=info");
    }
}
