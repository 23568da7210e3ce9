//! Group restart policy.
//!
//! Under `RecreateGroupOnPodRestart`, the failure of any pod of a group tears down the whole
//! group. This is done by deleting the leader pod with foreground propagation: its worker
//! StatefulSet is garbage collected first, and the LeaderWorkerSet controller then recreates the
//! leader, which in turn recreates the workers.

use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;

use crate::k8s::pods;
use crate::k8s::store::Store;
use lws_core::crd::{LeaderWorkerSet, RestartPolicy};
use lws_core::AppError;

/// The outcome of evaluating the restart policy for a pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartDecision {
    /// No restart applies to the pod's group.
    NotRequired,
    /// The group's leader is already being deleted.
    InProgress,
    /// The group's leader was deleted by this call.
    Triggered,
}

impl RestartDecision {
    /// Check if the group is being restarted, in which case reconciliation must stop.
    pub fn is_restarting(&self) -> bool {
        !matches!(self, Self::NotRequired)
    }
}

/// Evaluate the restart policy of the given LeaderWorkerSet for the given pod.
#[tracing::instrument(level = "debug", skip(store, pod, lws), fields(pod = pods::name(pod)))]
pub async fn handle_restart_policy<S: Store + ?Sized>(store: &S, pod: &Pod, lws: &LeaderWorkerSet) -> Result<RestartDecision> {
    if lws.spec.leader_worker_template.restart_policy != RestartPolicy::RecreateGroupOnPodRestart {
        return Ok(RestartDecision::NotRequired);
    }
    if !pods::container_restarted(pod) && !pods::is_deleted(pod) {
        return Ok(RestartDecision::NotRequired);
    }

    let fetched;
    let leader = if pods::is_leader(pod) {
        pod
    } else {
        let name = pods::name(pod);
        let (leader_name, _ordinal) = pods::parent_name_and_ordinal(name).ok_or_else(|| AppError::InvalidPodName(name.into()))?;
        fetched = match store.get_pod(pods::namespace(pod), leader_name).await? {
            Some(leader) => leader,
            None => {
                tracing::debug!(leader = leader_name, "leader pod already gone");
                return Ok(RestartDecision::InProgress);
            }
        };
        &fetched
    };

    // A leader which is already terminating needs no further delete requests.
    if pods::is_deleted(leader) {
        return Ok(RestartDecision::InProgress);
    }
    tracing::info!(leader = pods::name(leader), "recreating group");
    store.delete_pod_foreground(pods::namespace(leader), pods::name(leader)).await?;
    Ok(RestartDecision::Triggered)
}
