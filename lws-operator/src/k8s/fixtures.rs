use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ControllerRevision, StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Node, Pod, PodSpec, PodStatus, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use maplit::btreemap;
use serde_json::Value;

use crate::k8s::store::Store;
use lws_core::crd::{LeaderWorkerSet, LeaderWorkerSetSpec, LeaderWorkerTemplate, RestartPolicy, StartupPolicy};
use lws_core::{AppError, LABEL_GROUP_INDEX, LABEL_GROUP_UNIQUE_HASH, LABEL_SET_NAME, LABEL_TEMPLATE_REVISION_HASH, LABEL_WORKER_INDEX};

pub const NAMESPACE: &str = "default";
pub const LWS_NAME: &str = "vllm";
pub const LWS_UID: &str = "5e0c2a4d-lws";
pub const TEMPLATE_HASH: &str = "abc123";

/// A mutating call made against a `MemStore`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    DeletePod(String),
    ApplyStatefulSet(String),
    CreateRevision(String),
    UpdateRevision(String, i64),
    DeleteRevision(String),
}

#[derive(Default)]
struct State {
    pods: BTreeMap<(String, String), Pod>,
    groups: BTreeMap<(String, String), LeaderWorkerSet>,
    statefulsets: BTreeMap<(String, String), StatefulSet>,
    nodes: BTreeMap<String, Node>,
    revisions: BTreeMap<(String, String), ControllerRevision>,
    mutations: Vec<Mutation>,
}

/// An in-memory `Store`, recording every mutation made through it.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn meta_key(meta: &ObjectMeta) -> (String, String) {
    key(meta.namespace.as_deref().unwrap_or_default(), meta.name.as_deref().unwrap_or_default())
}

impl MemStore {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("store mutex poisoned")
    }

    pub fn put_pod(&self, pod: Pod) {
        self.state().pods.insert(meta_key(&pod.metadata), pod);
    }

    pub fn put_group(&self, lws: LeaderWorkerSet) {
        self.state().groups.insert(meta_key(&lws.metadata), lws);
    }

    pub fn put_statefulset(&self, sts: StatefulSet) {
        self.state().statefulsets.insert(meta_key(&sts.metadata), sts);
    }

    pub fn put_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.state().nodes.insert(name, node);
    }

    pub fn put_revision(&self, revision: ControllerRevision) {
        self.state().revisions.insert(meta_key(&revision.metadata), revision);
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state().pods.get(&key(NAMESPACE, name)).cloned()
    }

    pub fn statefulset(&self, name: &str) -> Option<StatefulSet> {
        self.state().statefulsets.get(&key(NAMESPACE, name)).cloned()
    }

    /// All stored revisions, ordered by revision number.
    pub fn revisions(&self) -> Vec<ControllerRevision> {
        let mut revisions: Vec<_> = self.state().revisions.values().cloned().collect();
        revisions.sort_by_key(|rev| rev.revision);
        revisions
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state().mutations.clear();
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.state().pods.get(&key(namespace, name)).cloned())
    }

    async fn delete_pod_foreground(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.mutations.push(Mutation::DeletePod(name.into()));
        // Foreground deletion leaves the pod in place until its dependents are gone.
        if let Some(pod) = state.pods.get_mut(&key(namespace, name)) {
            pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        Ok(())
    }

    async fn get_leader_worker_set(&self, namespace: &str, name: &str) -> Result<Option<LeaderWorkerSet>> {
        Ok(self.state().groups.get(&key(namespace, name)).cloned())
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.state().statefulsets.get(&key(namespace, name)).cloned())
    }

    async fn apply_statefulset(&self, namespace: &str, name: &str, document: &Value, _field_manager: &str) -> Result<()> {
        let mut sts: StatefulSet = serde_json::from_value(document.clone()).context("error deserializing applied StatefulSet")?;
        let mut state = self.state();
        state.mutations.push(Mutation::ApplyStatefulSet(name.into()));
        if let Some(existing) = state.statefulsets.get(&key(namespace, name)) {
            sts.status = existing.status.clone();
        }
        state.statefulsets.insert(key(namespace, name), sts);
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.state().nodes.get(name).cloned())
    }

    async fn list_revisions(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<ControllerRevision>> {
        Ok(self
            .state()
            .revisions
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, rev)| rev)
            .filter(|rev| {
                let rev_labels = rev.metadata.labels.clone().unwrap_or_default();
                labels.iter().all(|(key, val)| rev_labels.get(key) == Some(val))
            })
            .cloned()
            .collect())
    }

    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Option<ControllerRevision>> {
        Ok(self.state().revisions.get(&key(namespace, name)).cloned())
    }

    async fn create_revision(&self, revision: &ControllerRevision) -> Result<ControllerRevision> {
        let mut state = self.state();
        let key = meta_key(&revision.metadata);
        if state.revisions.contains_key(&key) {
            return Err(AppError::AlreadyExists(key.1).into());
        }
        state.mutations.push(Mutation::CreateRevision(key.1.clone()));
        let mut created = revision.clone();
        created.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        state.revisions.insert(key, created.clone());
        Ok(created)
    }

    async fn update_revision_number(&self, namespace: &str, name: &str, revision: i64) -> Result<ControllerRevision> {
        let mut state = self.state();
        state.mutations.push(Mutation::UpdateRevision(name.into(), revision));
        let existing = state
            .revisions
            .get_mut(&key(namespace, name))
            .with_context(|| format!("revision {} not found", name))?;
        existing.revision = revision;
        Ok(existing.clone())
    }

    async fn delete_revision(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.mutations.push(Mutation::DeleteRevision(name.into()));
        state.revisions.remove(&key(namespace, name));
        Ok(())
    }
}

/// Build a LeaderWorkerSet with groups of the given size.
pub fn group(size: i32) -> LeaderWorkerSet {
    let mut lws = LeaderWorkerSet::new(
        LWS_NAME,
        LeaderWorkerSetSpec {
            replicas: 2,
            leader_worker_template: LeaderWorkerTemplate {
                leader_template: None,
                worker_template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(btreemap! {"app".into() => "vllm".into()}),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "worker".into(),
                            image: Some("vllm:0.4".into()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                size,
                restart_policy: RestartPolicy::Default,
                sub_group_policy: None,
            },
            startup_policy: StartupPolicy::LeaderCreated,
        },
    );
    lws.metadata.namespace = Some(NAMESPACE.into());
    lws.metadata.uid = Some(LWS_UID.into());
    lws
}

/// Build a pod of group 0 with the given worker index, scheduled on the given node.
pub fn group_pod(worker_index: u32, node: Option<&str>) -> Pod {
    let name = match worker_index {
        0 => format!("{}-0", LWS_NAME),
        idx => format!("{}-0-{}", LWS_NAME, idx),
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(NAMESPACE.into()),
            uid: Some(format!("uid-{}", name)),
            labels: Some(btreemap! {
                LABEL_SET_NAME.into() => LWS_NAME.into(),
                LABEL_WORKER_INDEX.into() => worker_index.to_string(),
                LABEL_GROUP_INDEX.into() => "0".into(),
                LABEL_GROUP_UNIQUE_HASH.into() => "f00d".into(),
                LABEL_TEMPLATE_REVISION_HASH.into() => TEMPLATE_HASH.into(),
            }),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(String::from),
            containers: vec![Container {
                name: "main".into(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        }),
    }
}

/// Mark the first container of the given pod as restarted.
pub fn restart_container(pod: &mut Pod) {
    let status = pod.status.get_or_insert_with(Default::default);
    status.container_statuses = Some(vec![ContainerStatus {
        name: "main".into(),
        restart_count: 1,
        ..Default::default()
    }]);
}

/// Build a node carrying the given labels.
pub fn node(name: &str, labels: BTreeMap<String, String>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Build the leader StatefulSet of the fixture group with the given readiness.
pub fn leader_statefulset(replicas: i32, ready: Option<i32>) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(LWS_NAME.into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        status: Some(StatefulSetStatus {
            replicas,
            ready_replicas: ready,
            ..Default::default()
        }),
    }
}
