//! LeaderWorkerSet CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ANNOTATION_EXCLUSIVE_KEY, ANNOTATION_SUBGROUP_EXCLUSIVE_KEY};

/// CRD spec for the LeaderWorkerSet resource.
///
/// A LeaderWorkerSet describes `replicas` groups of pods. Each group is made up of one leader
/// pod and `size - 1` worker pods, where the workers of a group are managed by a StatefulSet
/// named after, and owned by, the group's leader pod.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    status = "LeaderWorkerSetStatus",
    group = "leaderworkerset.x-k8s.io",
    version = "v1",
    kind = "LeaderWorkerSet",
    namespaced,
    derive = "PartialEq",
    shortname = "lws",
    printcolumn = r#"{"name":"Replicas","type":"number","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Size","type":"number","jsonPath":".spec.leaderWorkerTemplate.size"}"#,
    printcolumn = r#"{"name":"Ready","type":"number","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Restart Policy","type":"string","jsonPath":".spec.leaderWorkerTemplate.restartPolicy"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerSetSpec {
    /// The number of groups to create.
    #[serde(default = "LeaderWorkerSetSpec::replicas_default")]
    pub replicas: i32,
    /// The template for the pods of each group.
    pub leader_worker_template: LeaderWorkerTemplate,
    /// Determines when the workers of a group are created.
    #[serde(default)]
    pub startup_policy: StartupPolicy,
}

impl LeaderWorkerSetSpec {
    /// The default number of groups, which is 1.
    pub fn replicas_default() -> i32 {
        1
    }
}

/// The template of one group of a LeaderWorkerSet.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerTemplate {
    /// The template of the leader pod. When unset, the worker template is used for the leader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_template: Option<PodTemplateSpec>,
    /// The template of the worker pods.
    pub worker_template: PodTemplateSpec,
    /// The number of pods in each group, including the leader.
    #[serde(default = "LeaderWorkerTemplate::size_default")]
    pub size: i32,
    /// The behavior to apply when a pod of a group restarts.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Splits each group into sub-groups of the given size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_group_policy: Option<SubGroupPolicy>,
}

impl LeaderWorkerTemplate {
    /// The default group size, which is 1.
    pub fn size_default() -> i32 {
        1
    }
}

/// The sub-group policy of a group.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubGroupPolicy {
    /// The number of pods in each sub-group.
    pub sub_group_size: i32,
}

/// The restart policy of the pods of a group.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum RestartPolicy {
    /// Recreate the whole group when any of its pods is deleted or any container restarts.
    RecreateGroupOnPodRestart,
    /// Follow the restart behavior of the pods' own restart policy.
    #[default]
    #[serde(alias = "None")]
    Default,
}

/// The startup policy of a group.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum StartupPolicy {
    /// Create the workers as soon as the leader pod is created.
    #[default]
    LeaderCreated,
    /// Create the workers only once the leader StatefulSet reports all of its replicas ready.
    LeaderReady,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerSetStatus {
    /// The number of groups created.
    #[serde(default)]
    pub replicas: i32,
    /// The number of groups whose pods are all ready.
    #[serde(default)]
    pub ready_replicas: i32,
    /// The number of groups running the latest template revision.
    #[serde(default)]
    pub updated_replicas: i32,
}

impl LeaderWorkerSet {
    /// The node label used for exclusive placement of each group, if any.
    pub fn exclusive_topology_key(&self) -> Option<&str> {
        self.annotation(ANNOTATION_EXCLUSIVE_KEY)
    }

    /// The node label used for exclusive placement of each sub-group, if any.
    pub fn subgroup_exclusive_topology_key(&self) -> Option<&str> {
        self.annotation(ANNOTATION_SUBGROUP_EXCLUSIVE_KEY)
    }

    /// Get a non-empty annotation of this object.
    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
            .filter(|val| !val.is_empty())
    }
}
