//! HTTP server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::config_reload::ConfigWatcher;
use crate::layer::ResilienceLayer;
use crate::{Error, Result};

/// depguard server: the resilience layer behind an HTTP surface
pub struct Server {
    layer: Arc<ResilienceLayer>,
    config_path: Option<PathBuf>,
}

impl Server {
    /// Build the resilience layer; configuration errors are fatal here
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            layer: Arc::new(ResilienceLayer::init(config)?),
            config_path,
        })
    }

    /// The resilience layer
    #[must_use]
    pub fn layer(&self) -> &Arc<ResilienceLayer> {
        &self.layer
    }

    /// Serve until SIGINT/SIGTERM, then drain for `server.shutdown_timeout`
    pub async fn run(self) -> Result<()> {
        let config = self.layer.config();
        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let background = self.layer.spawn_background(&shutdown_tx);

        let _watcher = match &self.config_path {
            Some(path) => match ConfigWatcher::start(path.clone(), Arc::clone(&self.layer), shutdown_tx.subscribe()) {
                Ok(w) => {
                    info!(path = %path.display(), "Config hot-reload enabled");
                    Some(w)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to start config watcher, hot-reload disabled");
                    None
                }
            },
            None => None,
        };

        let state = Arc::new(AppState {
            #[cfg(feature = "metrics")]
            metrics: match crate::telemetry::install_prometheus() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "Prometheus exporter unavailable");
                    None
                }
            },
            ..AppState::new(Arc::clone(&self.layer), config.admin.resolve_token()?)
        });
        if state.admin_token.is_none() {
            warn!("No admin token configured, /admin routes are disabled");
        }

        let app = create_router(state);
        let listener = TcpListener::bind(addr).await?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            addr = %addr,
            dependencies = self.layer.breakers().len(),
            auth = self.layer.auth().is_some(),
            "depguard listening"
        );

        let grace = config.server.shutdown_timeout;
        let mut drain_rx = shutdown_tx.subscribe();
        let serve = async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(shutdown_tx))
                .await
        };

        tokio::select! {
            result = serve => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                let _ = drain_rx.recv().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(grace_secs = grace.as_secs(), "Shutdown grace period elapsed, dropping in-flight requests");
            }
        }

        for handle in background {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task failed");
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
