use anyhow::Result;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use maplit::btreemap;

use crate::k8s::fixtures::*;
use crate::k8s::workers::*;
use lws_core::crd::SubGroupPolicy;
use lws_core::{
    AppError, ANNOTATION_EXCLUSIVE_KEY, ANNOTATION_LEADER_POD_NAME, ANNOTATION_LEADER_REQUESTS_TPUS, ANNOTATION_SIZE,
    ANNOTATION_SUBGROUP_EXCLUSIVE_KEY, ANNOTATION_SUBGROUP_SIZE, ANNOTATION_WORKER_CONFIG_HASH, LABEL_GROUP_INDEX,
    LABEL_GROUP_UNIQUE_HASH, LABEL_SET_NAME, LABEL_TEMPLATE_REVISION_HASH, RESOURCE_TPU,
};

#[test]
fn worker_statefulset_mirrors_leader_group() -> Result<()> {
    let leader = group_pod(0, Some("node-a"));
    let workers = build_worker_statefulset(&leader, &group(4))?;

    assert!(workers.name == "vllm-0", "unexpected name, got {}, expected {}", workers.name, "vllm-0");
    assert!(workers.namespace == NAMESPACE, "unexpected namespace, got {}", workers.namespace);
    assert!(workers.replicas == 3, "unexpected replicas, got {}, expected {}", workers.replicas, 3);
    assert!(workers.service_name == LWS_NAME, "unexpected service name, got {}", workers.service_name);

    let expected_selector = btreemap! {
        LABEL_GROUP_INDEX.to_string() => "0".to_string(),
        LABEL_SET_NAME.to_string() => LWS_NAME.to_string(),
        LABEL_GROUP_UNIQUE_HASH.to_string() => "f00d".to_string(),
    };
    assert!(workers.selector == expected_selector, "unexpected selector, got {:?}", workers.selector);
    assert!(
        workers.labels.get(LABEL_TEMPLATE_REVISION_HASH).map(String::as_str) == Some(TEMPLATE_HASH),
        "expected template revision hash label, got {:?}",
        workers.labels
    );

    let meta = workers.template.metadata.clone().unwrap_or_default();
    let labels = meta.labels.unwrap_or_default();
    assert!(labels.get("app").map(String::as_str) == Some("vllm"), "expected template labels to be kept, got {:?}", labels);
    assert!(labels.get(LABEL_SET_NAME).map(String::as_str) == Some(LWS_NAME), "expected group labels on template, got {:?}", labels);
    let annotations = meta.annotations.unwrap_or_default();
    assert!(annotations.get(ANNOTATION_SIZE).map(String::as_str) == Some("4"), "unexpected size annotation, got {:?}", annotations);
    assert!(
        annotations.get(ANNOTATION_LEADER_POD_NAME).map(String::as_str) == Some("vllm-0"),
        "unexpected leader name annotation, got {:?}",
        annotations
    );
    assert!(!annotations.contains_key(ANNOTATION_EXCLUSIVE_KEY), "expected no exclusive topology annotation");
    assert!(!annotations.contains_key(ANNOTATION_LEADER_REQUESTS_TPUS), "expected no TPU annotation");
    Ok(())
}

#[test]
fn worker_statefulset_carries_placement_annotations() -> Result<()> {
    let leader = group_pod(0, Some("node-a"));
    let mut lws = group(8);
    lws.metadata.annotations = Some(btreemap! {
        ANNOTATION_EXCLUSIVE_KEY.into() => "topology.kubernetes.io/zone".into(),
        ANNOTATION_SUBGROUP_EXCLUSIVE_KEY.into() => "cloud.google.com/gke-nodepool".into(),
    });
    lws.spec.leader_worker_template.sub_group_policy = Some(SubGroupPolicy { sub_group_size: 4 });

    let workers = build_worker_statefulset(&leader, &lws)?;

    let annotations = workers.template.metadata.and_then(|meta| meta.annotations).unwrap_or_default();
    let expected = [
        (ANNOTATION_EXCLUSIVE_KEY, "topology.kubernetes.io/zone"),
        (ANNOTATION_SUBGROUP_SIZE, "4"),
        (ANNOTATION_SUBGROUP_EXCLUSIVE_KEY, "cloud.google.com/gke-nodepool"),
    ];
    for (key, val) in expected {
        assert!(annotations.get(key).map(String::as_str) == Some(val), "unexpected value for {}, got {:?}", key, annotations.get(key));
    }
    Ok(())
}

#[test]
fn single_pod_groups_get_empty_worker_statefulset() -> Result<()> {
    let workers = build_worker_statefulset(&group_pod(0, None), &group(1))?;
    assert!(workers.replicas == 0, "unexpected replicas, got {}, expected {}", workers.replicas, 0);
    Ok(())
}

#[test]
fn invalid_size_is_rejected() -> Result<()> {
    let err = build_worker_statefulset(&group_pod(0, None), &group(0)).expect_err("expected an error for size 0");
    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidInput(_))),
        "unexpected error, got {:?}",
        err
    );
    Ok(())
}

#[test]
fn leader_tpu_requests_mark_workers() -> Result<()> {
    let mut leader = group_pod(0, None);
    if let Some(spec) = leader.spec.as_mut() {
        spec.containers[0].resources = Some(ResourceRequirements {
            limits: Some(btreemap! {RESOURCE_TPU.into() => Quantity("4".into())}),
            ..Default::default()
        });
    }

    let workers = build_worker_statefulset(&leader, &group(2))?;

    let annotations = workers.template.metadata.and_then(|meta| meta.annotations).unwrap_or_default();
    assert!(
        annotations.get(ANNOTATION_LEADER_REQUESTS_TPUS).map(String::as_str) == Some("true"),
        "expected TPU annotation, got {:?}",
        annotations
    );
    Ok(())
}

#[test]
fn apply_document_claims_workload_fields() -> Result<()> {
    let leader = group_pod(0, Some("node-a"));
    let mut workers = build_worker_statefulset(&leader, &group(4))?;
    workers.set_node_selector("topology.kubernetes.io/zone", "us-east1-b");
    workers.set_controller(&leader)?;

    let doc = workers.to_apply_document()?;

    assert!(doc["apiVersion"] == "apps/v1", "unexpected apiVersion, got {}", doc["apiVersion"]);
    assert!(doc["kind"] == "StatefulSet", "unexpected kind, got {}", doc["kind"]);
    assert!(doc["spec"]["replicas"] == 3, "unexpected replicas, got {}", doc["spec"]["replicas"]);
    assert!(doc["spec"]["podManagementPolicy"] == "Parallel", "unexpected pod management policy, got {}", doc["spec"]["podManagementPolicy"]);
    assert!(doc["spec"]["ordinals"]["start"] == 1, "unexpected ordinals start, got {}", doc["spec"]["ordinals"]["start"]);
    assert!(doc["spec"]["serviceName"] == LWS_NAME, "unexpected service name, got {}", doc["spec"]["serviceName"]);
    assert!(
        doc["spec"]["template"]["spec"]["nodeSelector"]["topology.kubernetes.io/zone"] == "us-east1-b",
        "unexpected node selector, got {}",
        doc["spec"]["template"]["spec"]["nodeSelector"]
    );
    let owner = &doc["metadata"]["ownerReferences"][0];
    assert!(owner["kind"] == "Pod", "unexpected owner kind, got {}", owner["kind"]);
    assert!(owner["uid"] == "uid-vllm-0", "unexpected owner uid, got {}", owner["uid"]);
    assert!(owner["blockOwnerDeletion"] == true, "expected owner to block deletion, got {}", owner["blockOwnerDeletion"]);
    Ok(())
}

#[test]
fn controller_requires_leader_uid() {
    let mut leader = group_pod(0, None);
    leader.metadata.uid = None;
    let mut workers = WorkerSet {
        name: "vllm-0".into(),
        namespace: NAMESPACE.into(),
        labels: Default::default(),
        selector: Default::default(),
        replicas: 1,
        service_name: LWS_NAME.into(),
        template: Default::default(),
        owner_references: vec![],
    };
    assert!(workers.set_controller(&leader).is_err(), "expected an error for a leader without a uid");
}

#[test]
fn apply_document_hash_tracks_dropped_fields() -> Result<()> {
    let leader = group_pod(0, Some("node-a"));
    let mut pinned = build_worker_statefulset(&leader, &group(4))?;
    pinned.set_node_selector("topology.kubernetes.io/zone", "us-east1-b");
    let unpinned = build_worker_statefulset(&leader, &group(4))?;

    let pinned_doc = pinned.to_apply_document()?;
    let unpinned_doc = unpinned.to_apply_document()?;
    let hash_of = |doc: &serde_json::Value| doc["metadata"]["annotations"][ANNOTATION_WORKER_CONFIG_HASH].as_str().map(String::from);

    assert!(hash_of(&unpinned_doc).is_some(), "expected the document to carry its hash, got {}", unpinned_doc["metadata"]);
    assert!(hash_of(&pinned_doc) != hash_of(&unpinned_doc), "expected dropping a field to change the hash");
    assert!(
        hash_of(&unpinned.to_apply_document()?) == hash_of(&unpinned_doc),
        "expected the hash to be stable for the same document"
    );
    Ok(())
}
