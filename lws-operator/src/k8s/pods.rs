//! Pod inspection helpers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use lazy_static::lazy_static;
use regex::Regex;

use lws_core::{LABEL_WORKER_INDEX, LEADER_WORKER_INDEX, RESOURCE_TPU};

lazy_static! {
    /// Matches the names of StatefulSet pods, capturing the parent name and the ordinal.
    static ref STATEFUL_POD_NAME: Regex = Regex::new(r"^(.*)-([0-9]+)$").expect("invalid stateful pod name regex");
}

/// The name of the given pod.
pub fn name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// The namespace of the given pod.
pub fn namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or_default()
}

/// Get the value of a label of the given pod.
pub fn label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata.labels.as_ref().and_then(|labels| labels.get(key)).map(String::as_str)
}

/// Check if the given pod is the leader of its group.
pub fn is_leader(pod: &Pod) -> bool {
    label(pod, LABEL_WORKER_INDEX) == Some(LEADER_WORKER_INDEX)
}

/// Check if the given pod has been marked for deletion.
pub fn is_deleted(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// The name of the node the given pod is scheduled on, if any.
pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()).filter(|name| !name.is_empty())
}

/// Check if any container of the given running or pending pod has restarted.
pub fn container_restarted(pod: &Pod) -> bool {
    let status = match pod.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    if !matches!(status.phase.as_deref(), Some("Running") | Some("Pending")) {
        return false;
    }
    let restarted = |statuses: &Option<Vec<ContainerStatus>>| statuses.iter().flatten().any(|stat| stat.restart_count > 0);
    restarted(&status.init_container_statuses) || restarted(&status.container_statuses)
}

/// Split the name of a StatefulSet pod into its parent name and ordinal.
pub fn parent_name_and_ordinal(name: &str) -> Option<(&str, i32)> {
    let captures = STATEFUL_POD_NAME.captures(name)?;
    let parent = captures.get(1)?.as_str();
    let ordinal = captures.get(2)?.as_str().parse().ok()?;
    Some((parent, ordinal))
}

/// Check if any container of the given pod spec requests TPUs.
pub fn requests_tpus(spec: &PodSpec) -> bool {
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .filter_map(|container| container.resources.as_ref())
        .any(|resources| has_tpu(&resources.limits) || has_tpu(&resources.requests))
}

fn has_tpu(list: &Option<BTreeMap<String, Quantity>>) -> bool {
    list.as_ref().map(|list| list.contains_key(RESOURCE_TPU)).unwrap_or(false)
}
