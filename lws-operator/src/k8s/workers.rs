//! Worker StatefulSet construction.
//!
//! The workers of each group are managed by a StatefulSet named after, and owned by, the
//! group's leader pod. The StatefulSet is modelled here as a `WorkerSet`, and is only converted
//! into a generic apply document when handed to the API server.

use std::collections::BTreeMap;

use anyhow::{ensure, Context, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::{json, Value};

use crate::k8s::pods;
use lws_core::crd::{LeaderWorkerSet, RequiredMetadata};
use lws_core::{
    AppError, ANNOTATION_EXCLUSIVE_KEY, ANNOTATION_LEADER_POD_NAME, ANNOTATION_LEADER_REQUESTS_TPUS, ANNOTATION_SIZE,
    ANNOTATION_SUBGROUP_EXCLUSIVE_KEY, ANNOTATION_SUBGROUP_SIZE, ANNOTATION_WORKER_CONFIG_HASH, LABEL_GROUP_INDEX,
    LABEL_GROUP_UNIQUE_HASH, LABEL_SET_NAME, LABEL_TEMPLATE_REVISION_HASH,
};

/// The pod management policy of worker StatefulSets.
///
/// Workers depend on their leader rather than on each other, so they start and stop in parallel.
const POD_MANAGEMENT_POLICY_PARALLEL: &str = "Parallel";
/// The ordinal of the first worker pod, as the leader implicitly holds ordinal 0.
const WORKER_ORDINAL_START: i32 = 1;

/// The desired state of the worker StatefulSet of one group.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSet {
    /// The name of the StatefulSet, which is the name of the leader pod.
    pub name: String,
    /// The namespace of the StatefulSet.
    pub namespace: String,
    /// The labels of the StatefulSet and its pods.
    pub labels: BTreeMap<String, String>,
    /// The label selector of the StatefulSet.
    ///
    /// This excludes the template revision hash, so that a template change never orphans pods.
    pub selector: BTreeMap<String, String>,
    /// The number of worker pods.
    pub replicas: i32,
    /// The name of the headless service governing the StatefulSet.
    pub service_name: String,
    /// The template of the worker pods.
    pub template: PodTemplateSpec,
    /// The owner references of the StatefulSet.
    pub owner_references: Vec<OwnerReference>,
}

impl WorkerSet {
    /// Constrain the worker pods to nodes carrying the given label value.
    ///
    /// Workers already scheduled elsewhere are rolled by the StatefulSet once applied.
    pub fn set_node_selector(&mut self, key: &str, value: &str) {
        let spec = self.template.spec.get_or_insert_with(Default::default);
        spec.node_selector.get_or_insert_with(Default::default).insert(key.into(), value.into());
    }

    /// Make the given leader pod the controller of this StatefulSet.
    pub fn set_controller(&mut self, leader: &Pod) -> Result<()> {
        let uid = leader
            .metadata
            .uid
            .clone()
            .ok_or_else(|| AppError::InvalidInput(format!("pod {} has no uid", pods::name(leader))))?;
        self.owner_references = vec![OwnerReference {
            api_version: "v1".into(),
            kind: "Pod".into(),
            name: pods::name(leader).into(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        }];
        Ok(())
    }

    /// Render this StatefulSet as a Server-Side Apply document.
    ///
    /// Only the fields set here are claimed by the field manager. The document is stamped with
    /// the hash of its own content, so that a later apply can tell whether any field was
    /// added, changed or dropped since.
    pub fn to_apply_document(&self) -> Result<Value> {
        let template = serde_json::to_value(&self.template).context("error serializing worker pod template")?;
        let mut metadata = json!({
            "name": self.name,
            "namespace": self.namespace,
            "labels": self.labels,
        });
        if !self.owner_references.is_empty() {
            metadata["ownerReferences"] = serde_json::to_value(&self.owner_references).context("error serializing owner references")?;
        }
        let mut document = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": metadata,
            "spec": {
                "serviceName": self.service_name,
                "replicas": self.replicas,
                "podManagementPolicy": POD_MANAGEMENT_POLICY_PARALLEL,
                "template": template,
                "ordinals": {"start": WORKER_ORDINAL_START},
                "selector": {"matchLabels": self.selector},
            },
        });
        let hash = config_hash(&document)?;
        document["metadata"]["annotations"] = json!({ (ANNOTATION_WORKER_CONFIG_HASH): hash });
        Ok(document)
    }
}

/// Hash the given apply document.
pub fn config_hash(document: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(document).context("error serializing worker StatefulSet document")?;
    Ok(format!("{:x}", seahash::hash(&bytes)))
}

/// Get the hash of the document the given StatefulSet was last applied from, if any.
pub fn applied_config_hash(sts: &StatefulSet) -> Option<&str> {
    sts.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_WORKER_CONFIG_HASH))
        .map(String::as_str)
}

/// Build the worker StatefulSet of the given leader pod's group.
pub fn build_worker_statefulset(leader: &Pod, lws: &LeaderWorkerSet) -> Result<WorkerSet> {
    let name = pods::name(leader);
    ensure!(!name.is_empty(), AppError::InvalidInput("leader pod has no name".into()));
    let lwt = &lws.spec.leader_worker_template;
    ensure!(
        lwt.size >= 1,
        AppError::InvalidInput(format!("LeaderWorkerSet {} has invalid size {}", lws.name(), lwt.size))
    );

    let leader_label = |key: &str| pods::label(leader, key).unwrap_or_default().to_string();
    let mut selector = BTreeMap::new();
    selector.insert(LABEL_GROUP_INDEX.to_string(), leader_label(LABEL_GROUP_INDEX));
    selector.insert(LABEL_SET_NAME.to_string(), lws.name().to_string());
    selector.insert(LABEL_GROUP_UNIQUE_HASH.to_string(), leader_label(LABEL_GROUP_UNIQUE_HASH));
    let mut labels = selector.clone();
    labels.insert(LABEL_TEMPLATE_REVISION_HASH.to_string(), leader_label(LABEL_TEMPLATE_REVISION_HASH));

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_SIZE.to_string(), lwt.size.to_string());
    annotations.insert(ANNOTATION_LEADER_POD_NAME.to_string(), name.to_string());
    if let Some(key) = lws.exclusive_topology_key() {
        annotations.insert(ANNOTATION_EXCLUSIVE_KEY.to_string(), key.to_string());
    }
    if let Some(policy) = lwt.sub_group_policy.as_ref() {
        annotations.insert(ANNOTATION_SUBGROUP_SIZE.to_string(), policy.sub_group_size.to_string());
        if let Some(key) = lws.subgroup_exclusive_topology_key() {
            annotations.insert(ANNOTATION_SUBGROUP_EXCLUSIVE_KEY.to_string(), key.to_string());
        }
    }
    add_tpu_annotations(leader, &mut annotations);

    let mut template = lwt.worker_template.clone();
    let meta = template.metadata.get_or_insert_with(Default::default);
    meta.labels.get_or_insert_with(Default::default).extend(labels.clone());
    meta.annotations.get_or_insert_with(Default::default).extend(annotations);

    Ok(WorkerSet {
        name: name.to_string(),
        namespace: pods::namespace(leader).to_string(),
        labels,
        selector,
        replicas: lwt.size - 1,
        service_name: lws.name().to_string(),
        template,
        owner_references: vec![],
    })
}

/// Propagate the accelerator annotations of the given leader pod to its workers.
///
/// Workers of a leader which requests TPUs are marked, so that TPU topology environment
/// injection treats the leader as part of the TPU slice.
pub fn add_tpu_annotations(leader: &Pod, annotations: &mut BTreeMap<String, String>) {
    let marked = leader
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_LEADER_REQUESTS_TPUS))
        .map(|val| val == "true")
        .unwrap_or(false);
    if marked || leader.spec.as_ref().map(pods::requests_tpus).unwrap_or(false) {
        annotations.insert(ANNOTATION_LEADER_REQUESTS_TPUS.to_string(), "true".to_string());
    }
}
