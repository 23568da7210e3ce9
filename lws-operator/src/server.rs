use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Health server, exposing liveness and readiness probes.
pub struct AppServer {
    /// The application's runtime config.
    config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, shutdown }
    }

    /// Bind the listener and spawn the HTTP server.
    pub async fn spawn(self) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.http_port))
            .await
            .with_context(|| format!("error binding health server to port {}", self.config.http_port))?;
        let app = Router::new()
            .route("/healthz", get(|| async { StatusCode::OK }))
            .route("/readyz", get(|| async { StatusCode::OK }));

        let shutdown = self.shutdown.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        Ok(tokio::spawn(async move {
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _res = shutdown_rx.recv().await;
                })
                .await;
            if let Err(err) = res {
                tracing::error!(error = ?err, "error from http server, shutting down");
                let _res = shutdown.send(());
            }
        }))
    }
}
