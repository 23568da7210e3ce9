//! The K8s API surface used by the reconcilers.
//!
//! Every read and write performed by the pod reconciler and the revision history goes through
//! the `Store` trait, so that their state machines can be exercised against an in-memory store.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ControllerRevision, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use serde_json::{json, Value};
use tokio::time::timeout;

use lws_core::crd::LeaderWorkerSet;
use lws_core::AppError;

/// The operations the reconcilers need from the cluster.
///
/// Reads of missing objects yield `None` and deletes of missing objects succeed, so callers only
/// ever see errors which are worth retrying or reporting.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the target Pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Delete the target Pod with foreground propagation, so that its dependents are removed first.
    async fn delete_pod_foreground(&self, namespace: &str, name: &str) -> Result<()>;

    /// Fetch the target LeaderWorkerSet.
    async fn get_leader_worker_set(&self, namespace: &str, name: &str) -> Result<Option<LeaderWorkerSet>>;

    /// Fetch the target StatefulSet.
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    /// Apply the given StatefulSet document using Server-Side Apply, forcing ownership of conflicting fields.
    async fn apply_statefulset(&self, namespace: &str, name: &str, document: &Value, field_manager: &str) -> Result<()>;

    /// Fetch the target Node.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// List the ControllerRevisions of the namespace which carry all of the given labels.
    async fn list_revisions(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<ControllerRevision>>;

    /// Fetch the target ControllerRevision.
    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Option<ControllerRevision>>;

    /// Create the given ControllerRevision.
    ///
    /// Fails with `AppError::AlreadyExists` when an object of the same name exists.
    async fn create_revision(&self, revision: &ControllerRevision) -> Result<ControllerRevision>;

    /// Set the revision number of the target ControllerRevision.
    async fn update_revision_number(&self, namespace: &str, name: &str, revision: i64) -> Result<ControllerRevision>;

    /// Delete the target ControllerRevision.
    async fn delete_revision(&self, namespace: &str, name: &str) -> Result<()>;
}

/// The status code of a missing object.
const STATUS_NOT_FOUND: u16 = 404;
/// The status code of a create request conflicting with an existing object.
const STATUS_CONFLICT: u16 = 409;

/// A `Store` backed by the K8s API.
#[derive(Clone)]
pub struct KubeStore {
    /// K8s client.
    client: Client,
    /// The timeout applied to each API call.
    timeout: Duration,
}

impl KubeStore {
    /// Create a new instance.
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Fetch the target object, mapping a 404 to `None`.
    async fn get_opt<K>(&self, api: Api<K>, name: &str, kind: &'static str) -> Result<Option<K>>
    where
        K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        timeout(self.timeout, api.get_opt(name))
            .await
            .with_context(|| format!("timeout while fetching {} {}", kind, name))?
            .with_context(|| format!("error fetching {} {}", kind, name))
    }
}

#[async_trait]
impl Store for KubeStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.get_opt(Api::namespaced(self.client.clone(), namespace), name, "Pod").await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_pod_foreground(&self, namespace: &str, name: &str) -> Result<()> {
        tracing::info!(%namespace, %name, "deleting Pod with foreground propagation");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let res = timeout(self.timeout, api.delete(name, &DeleteParams::foreground()))
            .await
            .context("timeout while deleting Pod")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) if is_status(&err, STATUS_NOT_FOUND) => Ok(()),
            Err(err) => Err(err).context("error deleting Pod"),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_leader_worker_set(&self, namespace: &str, name: &str) -> Result<Option<LeaderWorkerSet>> {
        self.get_opt(Api::namespaced(self.client.clone(), namespace), name, "LeaderWorkerSet").await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        self.get_opt(Api::namespaced(self.client.clone(), namespace), name, "StatefulSet").await
    }

    #[tracing::instrument(level = "debug", skip(self, document))]
    async fn apply_statefulset(&self, namespace: &str, name: &str, document: &Value, field_manager: &str) -> Result<()> {
        tracing::info!(%namespace, %name, "applying worker StatefulSet");
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(field_manager).force();
        timeout(self.timeout, api.patch(name, &params, &Patch::Apply(document)))
            .await
            .context("timeout while applying worker StatefulSet")?
            .context("error applying worker StatefulSet")
            .map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.get_opt(Api::all(self.client.clone()), name, "Node").await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_revisions(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<ControllerRevision>> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        let revisions = timeout(self.timeout, api.list(&params))
            .await
            .context("timeout while listing ControllerRevisions")?
            .context("error listing ControllerRevisions")?;
        Ok(revisions.items)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Option<ControllerRevision>> {
        self.get_opt(Api::namespaced(self.client.clone(), namespace), name, "ControllerRevision").await
    }

    #[tracing::instrument(level = "debug", skip(self, revision))]
    async fn create_revision(&self, revision: &ControllerRevision) -> Result<ControllerRevision> {
        let namespace = revision.metadata.namespace.as_deref().unwrap_or_default();
        let name = revision.metadata.name.as_deref().unwrap_or_default();
        tracing::info!(%namespace, %name, revision = revision.revision, "creating ControllerRevision");
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        let res = timeout(self.timeout, api.create(&PostParams::default(), revision))
            .await
            .context("timeout while creating ControllerRevision")?;
        match res {
            Ok(created) => Ok(created),
            Err(err) if is_status(&err, STATUS_CONFLICT) => Err(AppError::AlreadyExists(name.into()).into()),
            Err(err) => Err(err).context("error creating ControllerRevision"),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn update_revision_number(&self, namespace: &str, name: &str, revision: i64) -> Result<ControllerRevision> {
        tracing::info!(%namespace, %name, revision, "updating ControllerRevision number");
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "revision": revision });
        timeout(self.timeout, api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while updating ControllerRevision")?
            .context("error updating ControllerRevision")
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_revision(&self, namespace: &str, name: &str) -> Result<()> {
        tracing::info!(%namespace, %name, "deleting ControllerRevision");
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        let res = timeout(self.timeout, api.delete(name, &DeleteParams::default()))
            .await
            .context("timeout while deleting ControllerRevision")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) if is_status(&err, STATUS_NOT_FOUND) => Ok(()),
            Err(err) => Err(err).context("error deleting ControllerRevision"),
        }
    }
}

/// Check if the given error is an API error with the given status code.
fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == code)
}

/// Render the given labels as an equality-based label selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(key, val)| format!("{}={}", key, val)).collect::<Vec<_>>().join(",")
}
