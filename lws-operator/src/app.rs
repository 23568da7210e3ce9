//! Process lifecycle of the operator.
//!
//! The pod controller and the health server run as separate tasks sharing one broadcast
//! channel. A termination signal, or either task failing, closes both.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::Controller;
use crate::server::AppServer;

/// The running operator.
pub struct App {
    /// Sends the shutdown signal to all tasks.
    shutdown_tx: broadcast::Sender<()>,
    /// Observes shutdown signals sent by any task.
    shutdown_rx: BroadcastStream<()>,
    /// The health server task.
    server: JoinHandle<()>,
    /// The pod controller task.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Connect to the cluster and start the health server and the pod controller.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        let server = AppServer::new(config.clone(), shutdown_tx.clone())
            .spawn()
            .await
            .context("error setting up health server")?;
        let controller = Controller::new(client, config, shutdown_tx.clone()).spawn();

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = termination_signals()?;
        tokio::select! {
            Some((name, _)) = signals.next() => {
                tracing::info!(signal = name, "signal received, shutting down");
                let _ = self.shutdown_tx.send(());
            }
            _ = self.shutdown_rx.next() => tracing::info!("shutdown requested by a failed task"),
        }

        if let Err(err) = self.server.await {
            tracing::error!(error = ?err, "error joining health server task");
        }
        if let Err(err) = self.controller.await.context("error joining pod controller task").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down pod controller");
        }
        tracing::debug!("LeaderWorkerSet operator shutdown complete");
        Ok(())
    }
}

/// Build a stream of the signals which terminate the operator, keyed by signal name.
fn termination_signals() -> Result<StreamMap<&'static str, SignalStream>> {
    let mut signals = StreamMap::new();
    for (name, kind) in [("sigterm", SignalKind::terminate()), ("sigint", SignalKind::interrupt())] {
        let stream = signal(kind).with_context(|| format!("error building {} signal stream", name))?;
        signals.insert(name, SignalStream::new(stream));
    }
    Ok(signals)
}
