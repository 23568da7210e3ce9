//! Topology resolution for exclusive placement.

use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;

use crate::k8s::pods;
use crate::k8s::store::Store;
use lws_core::AppError;

/// Get the value of the given topology label on the node the leader pod is scheduled on.
///
/// Returns `None` when the node does not exist, which may happen temporarily during node
/// maintenance. A node which exists but lacks the label is a misconfiguration.
#[tracing::instrument(level = "debug", skip(store, leader), fields(pod = pods::name(leader)))]
pub async fn topology_value<S: Store + ?Sized>(store: &S, leader: &Pod, key: &str) -> Result<Option<String>> {
    let node_name = pods::node_name(leader).unwrap_or_default();
    let node = match store.get_node(node_name).await? {
        Some(node) => node,
        None => {
            tracing::warn!(node = node_name, "node of leader pod not found");
            return Ok(None);
        }
    };
    match node.metadata.labels.as_ref().and_then(|labels| labels.get(key)) {
        Some(val) => Ok(Some(val.clone())),
        None => Err(AppError::MissingTopologyLabel {
            node: node_name.into(),
            key: key.into(),
        }
        .into()),
    }
}
