//! Kubernetes controller.
//!
//! This controller watches the pods of all LeaderWorkerSets, along with the worker StatefulSets
//! owned by leader pods, and reconciles each of them through the `PodReconciler`. Events are
//! deduplicated per pod by the runtime, and a failed reconciliation is retried after a delay.

pub mod history;
pub mod patch;
pub mod pod;
pub mod pods;
pub mod restart;
pub mod store;
pub mod topology;
pub mod workers;

#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod workers_test;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::prelude::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller as RuntimeController};
use kube::runtime::watcher;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::k8s::pod::{PodReconciler, ReconcileOutcome};
use crate::k8s::store::KubeStore;
use lws_core::LABEL_SET_NAME;

/// An error from a single reconciliation, as reported to the controller runtime.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("error reconciling pod: {0}")]
    Pod(#[from] anyhow::Error),
}

/// The state shared by all reconciliations.
struct Context {
    /// The reconciler of leader pods.
    reconciler: PodReconciler<KubeStore>,
    /// The delay before a deferred or failed reconciliation is retried.
    retry_after: Duration,
}

/// Kubernetes controller for LeaderWorkerSet pods.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self { client, config, shutdown_tx }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let (pods, statefulsets): (Api<Pod>, Api<StatefulSet>) = match self.config.namespace.as_deref() {
            Some(ns) => (Api::namespaced(self.client.clone(), ns), Api::namespaced(self.client.clone(), ns)),
            None => (Api::all(self.client.clone()), Api::all(self.client.clone())),
        };
        let store = KubeStore::new(self.client.clone(), self.config.api_timeout());
        let ctx = Arc::new(Context {
            reconciler: PodReconciler::new(store, self.config.field_manager.clone()),
            retry_after: self.config.retry_after(),
        });

        // Only pods and StatefulSets of LeaderWorkerSets are of interest.
        let selector = watcher::Config::default().labels(LABEL_SET_NAME);
        let runtime_config = controller::Config::default().concurrency(self.config.reconcile_concurrency);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tracing::info!("k8s controller initialized");
        RuntimeController::new(pods, selector.clone())
            .owns(statefulsets, selector)
            .with_config(runtime_config)
            .graceful_shutdown_on(async move {
                let _res = shutdown_rx.recv().await;
            })
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok((obj, action)) => tracing::debug!(pod = %obj, ?action, "reconciled pod"),
                    Err(err) => tracing::warn!(error = %err, "error from pod controller"),
                }
            })
            .await;

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }
}

/// Reconcile the given pod, deciding when it must be looked at again.
async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let outcome = ctx.reconciler.reconcile(pods::namespace(&pod), pods::name(&pod)).await?;
    Ok(match outcome {
        // These wait on state which does not emit events on the pod itself.
        ReconcileOutcome::LeaderNotReady | ReconcileOutcome::NodeNotFound => Action::requeue(ctx.retry_after),
        _ => Action::await_change(),
    })
}

fn error_policy(pod: Arc<Pod>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    tracing::error!(error = ?err, pod = pods::name(&pod), "error reconciling pod");
    Action::requeue(ctx.retry_after)
}
