//! depguard: a dependency-resilience layer
//!
//! Keeps a networked service available while its downstream dependencies
//! are slow, unreachable or misconfigured.
//!
//! # Features
//!
//! - **Resolver**: cached name resolution with stale-entry and static-override
//!   fallback, single-flighted per name
//! - **Circuit breakers**: per-dependency three-state breakers with backoff,
//!   a single half-open probe and manual reset
//! - **Connection strings**: scheme-correct, TLS-aware targets from
//!   fragmented configuration
//! - **Cached auth**: cache-first credential validation with bounded cache
//!   latency and an explicit fail-open/fail-closed policy
//! - **Health**: concurrent probes with degraded-but-serving classification
//!
//! # Example
//!
//! ```no_run
//! use depguard::{config::Config, layer::ResilienceLayer};
//!
//! # async fn demo() -> depguard::Result<()> {
//! let config = Config::load_validated(Some(std::path::Path::new("depguard.yaml")))?;
//! let layer = ResilienceLayer::init(config)?;
//!
//! let endpoint = layer.resolver().resolve("cache.example.internal").await?;
//! println!("{} via {}", endpoint.address(), endpoint.source);
//!
//! let snapshot = layer.health().snapshot().await;
//! println!("overall: {}", snapshot.overall);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod config_reload;
pub mod connection;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod health;
pub mod layer;
pub mod resolver;
pub mod singleflight;
pub mod telemetry;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` is `text` (default) or
/// `json`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
