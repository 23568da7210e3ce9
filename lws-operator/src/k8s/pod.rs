//! Pod reconciliation.
//!
//! Every event on a labelled pod, or on a worker StatefulSet owned by one, is funneled into
//! `PodReconciler::reconcile`. The reconciler re-reads all state it depends on, so repeated or
//! reordered deliveries of the same event converge on the same result.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;

use crate::k8s::patch;
use crate::k8s::pods;
use crate::k8s::restart::{handle_restart_policy, RestartDecision};
use crate::k8s::store::Store;
use crate::k8s::topology::topology_value;
use crate::k8s::workers::{applied_config_hash, build_worker_statefulset};
use lws_core::crd::{LeaderWorkerSet, RequiredMetadata, StartupPolicy};
use lws_core::{AppError, ANNOTATION_WORKER_CONFIG_HASH, LABEL_SET_NAME, LABEL_WORKER_INDEX};

/// The result of a single reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The pod no longer exists; its dependents are garbage collected.
    PodNotFound,
    /// The pod's LeaderWorkerSet no longer exists.
    GroupNotFound,
    /// The pod's group is being recreated.
    Restarting(RestartDecision),
    /// The pod is a worker, which owns nothing further.
    WorkerPod,
    /// The leader pod is terminating, so its workers must not be touched.
    LeaderTerminating,
    /// The leader StatefulSet is not ready yet, so workers are not created.
    LeaderNotReady,
    /// The leader pod has not been scheduled, so the workers' topology is unknown.
    LeaderNotScheduled,
    /// The node of the leader pod does not exist.
    NodeNotFound,
    /// The worker StatefulSet already matches its desired state.
    UpToDate,
    /// The worker StatefulSet was applied.
    Applied,
}

/// Reconciles the worker StatefulSets of leader pods.
pub struct PodReconciler<S> {
    /// The store used for all reads and writes.
    store: S,
    /// The field manager identity used for Server-Side Apply.
    field_manager: String,
}

impl<S: Store> PodReconciler<S> {
    /// Create a new instance.
    pub fn new(store: S, field_manager: impl Into<String>) -> Self {
        Self {
            store,
            field_manager: field_manager.into(),
        }
    }

    /// The store backing this reconciler.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reconcile the target pod.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let pod = match self.store.get_pod(namespace, name).await? {
            Some(pod) => pod,
            None => return Ok(ReconcileOutcome::PodNotFound),
        };

        let lws_name = pods::label(&pod, LABEL_SET_NAME).filter(|val| !val.is_empty()).ok_or_else(|| AppError::MissingLabel {
            pod: name.into(),
            label: LABEL_SET_NAME,
        })?;
        if pods::label(&pod, LABEL_WORKER_INDEX).is_none() {
            return Err(AppError::MissingLabel {
                pod: name.into(),
                label: LABEL_WORKER_INDEX,
            }
            .into());
        }
        let lws = match self.store.get_leader_worker_set(namespace, lws_name).await? {
            Some(lws) => lws,
            None => {
                tracing::debug!(lws = lws_name, "LeaderWorkerSet not found");
                return Ok(ReconcileOutcome::GroupNotFound);
            }
        };

        let decision = handle_restart_policy(&self.store, &pod, &lws)
            .await
            .context("error handling restart policy")?;
        if decision.is_restarting() {
            tracing::debug!(?decision, "restarting the group");
            return Ok(ReconcileOutcome::Restarting(decision));
        }

        if !pods::is_leader(&pod) {
            return Ok(ReconcileOutcome::WorkerPod);
        }

        // Creating the worker StatefulSet of a terminating leader would race with the
        // group being recreated.
        if pods::is_deleted(&pod) {
            tracing::debug!("skip creating the worker StatefulSet since the leader pod is being deleted");
            return Ok(ReconcileOutcome::LeaderTerminating);
        }

        if lws.spec.startup_policy == StartupPolicy::LeaderReady && !self.leader_statefulset_ready(&lws).await? {
            tracing::debug!("leader StatefulSet is not ready yet, deferring workers");
            return Ok(ReconcileOutcome::LeaderNotReady);
        }

        self.apply_worker_statefulset(&pod, &lws).await
    }

    /// Check if the leader StatefulSet of the given LeaderWorkerSet has all of its replicas ready.
    async fn leader_statefulset_ready(&self, lws: &LeaderWorkerSet) -> Result<bool> {
        let sts = match self.store.get_statefulset(lws.namespace(), lws.name()).await? {
            Some(sts) => sts,
            None => return Ok(false),
        };
        let desired = sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
        let ready = sts.status.as_ref().and_then(|status| status.ready_replicas).unwrap_or(0);
        Ok(ready >= desired)
    }

    /// Build the worker StatefulSet of the given leader pod and apply it unless it was last applied from
    /// the same document.
    async fn apply_worker_statefulset(&self, leader: &Pod, lws: &LeaderWorkerSet) -> Result<ReconcileOutcome> {
        let mut workers = build_worker_statefulset(leader, lws).context("error building worker StatefulSet")?;

        if let Some(key) = lws.exclusive_topology_key() {
            if pods::node_name(leader).is_none() {
                tracing::debug!(pod = pods::name(leader), "pod is not scheduled yet");
                return Ok(ReconcileOutcome::LeaderNotScheduled);
            }
            let value = match topology_value(&self.store, leader, key)
                .await
                .context("error getting topology from leader pod")?
            {
                Some(value) => value,
                None => return Ok(ReconcileOutcome::NodeNotFound),
            };
            workers.set_node_selector(key, &value);
        }

        workers.set_controller(leader).context("error setting controller reference")?;
        let document = workers.to_apply_document()?;

        // Skip the apply only when the last applied document is this very document and none of
        // its fields were overwritten since. A differing hash also covers dropped fields.
        if let Some(existing) = self.store.get_statefulset(&workers.namespace, &workers.name).await? {
            let desired_hash = document["metadata"]["annotations"][ANNOTATION_WORKER_CONFIG_HASH].as_str();
            let applied_hash = applied_config_hash(&existing);
            if applied_hash.is_some() && applied_hash == desired_hash {
                let existing = serde_json::to_value(&existing).context("error serializing existing worker StatefulSet")?;
                if patch::contains(&existing, &document) {
                    tracing::debug!("worker StatefulSet is up to date");
                    return Ok(ReconcileOutcome::UpToDate);
                }
            }
        }

        self.store
            .apply_statefulset(&workers.namespace, &workers.name, &document, &self.field_manager)
            .await?;
        tracing::debug!("worker reconcile completed");
        Ok(ReconcileOutcome::Applied)
    }
}
