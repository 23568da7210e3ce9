//! LeaderWorkerSet revision history.
//!
//! Every distinct spec of a LeaderWorkerSet is recorded as a ControllerRevision holding a patch
//! which restores that spec. Records are deduplicated by content: when a spec recurs, the
//! existing record is renumbered instead of a new one being created.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::Hasher;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::Resource;
use serde_json::Value;

use crate::k8s::patch::{self, PATCH_DIRECTIVE, PATCH_REPLACE};
use crate::k8s::store::Store;
use lws_core::crd::{LeaderWorkerSet, RequiredMetadata};
use lws_core::{AppError, LABEL_SET_NAME, LABEL_TEMPLATE_REVISION_HASH};

/// The label holding the content hash of a ControllerRevision.
pub const LABEL_REVISION_HASH: &str = "controller.kubernetes.io/hash";

/// The alphabet used to render hashes into object names, free of vowels and confusable characters.
const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
/// The longest name prefix a revision name may carry, leaving room for the hash suffix.
const MAX_NAME_PREFIX: usize = 223;
/// The number of name collisions tolerated before giving up on creating a revision.
const MAX_COLLISIONS: u32 = 32;

/// Build the patch which restores the spec of the given LeaderWorkerSet.
///
/// The patch replaces the spec wholesale, so fields absent from the recorded spec are cleared
/// when it is applied.
pub fn get_patch(lws: &LeaderWorkerSet) -> Result<Value> {
    let mut doc = serde_json::to_value(lws).context("error serializing LeaderWorkerSet")?;
    let mut spec = doc
        .get_mut("spec")
        .map(Value::take)
        .ok_or_else(|| AppError::InvalidInput(format!("LeaderWorkerSet {} has no spec", lws.name())))?;
    let fields = spec
        .as_object_mut()
        .ok_or_else(|| AppError::InvalidInput(format!("LeaderWorkerSet {} has a malformed spec", lws.name())))?;
    fields.insert(PATCH_DIRECTIVE.into(), PATCH_REPLACE.into());
    Ok(serde_json::json!({ "spec": spec }))
}

/// Build a new revision of the given LeaderWorkerSet, holding its current spec.
pub fn new_revision(lws: &LeaderWorkerSet, revision: i64, template_hash: &str) -> Result<ControllerRevision> {
    let owner = lws
        .controller_owner_ref(&())
        .ok_or_else(|| AppError::InvalidInput(format!("LeaderWorkerSet {} has no uid", lws.name())))?;
    let data = get_patch(lws)?;

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_SET_NAME.to_string(), lws.name().to_string());
    labels.insert(LABEL_TEMPLATE_REVISION_HASH.to_string(), template_hash.to_string());
    let hash = hash_revision(&data, 0)?;
    labels.insert(LABEL_REVISION_HASH.to_string(), hash.clone());

    Ok(ControllerRevision {
        metadata: ObjectMeta {
            name: Some(revision_name(lws.name(), &hash)),
            namespace: Some(lws.namespace().to_string()),
            labels: Some(labels),
            annotations: lws.meta().annotations.clone(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(RawExtension(data)),
        revision,
    })
}

/// Restore the given LeaderWorkerSet to the state recorded in the given revision.
pub fn apply_revision(lws: &LeaderWorkerSet, revision: &ControllerRevision) -> Result<LeaderWorkerSet> {
    let mut doc = serde_json::to_value(lws).context("error serializing LeaderWorkerSet")?;
    let data = revision_data(revision);
    patch::strategic_merge(&mut doc, &data);
    serde_json::from_value(doc).context("error deserializing restored LeaderWorkerSet")
}

/// Check if the given revisions hold the same content.
///
/// Content hashes are compared first when both revisions carry one.
pub fn equal_revision(lhs: &ControllerRevision, rhs: &ControllerRevision) -> bool {
    if let (Some(lhs_hash), Some(rhs_hash)) = (revision_label(lhs, LABEL_REVISION_HASH), revision_label(rhs, LABEL_REVISION_HASH)) {
        if lhs_hash != rhs_hash {
            return false;
        }
    }
    lhs.data.as_ref().map(|raw| &raw.0) == rhs.data.as_ref().map(|raw| &raw.0)
}

/// Find all revisions holding the same content as the needle, preserving their order.
pub fn find_equal_revisions<'a>(revisions: &'a [ControllerRevision], needle: &ControllerRevision) -> Vec<&'a ControllerRevision> {
    revisions.iter().filter(|rev| equal_revision(rev, needle)).collect()
}

/// Sort the given revisions by revision number, breaking ties by creation time and then by name.
pub fn sort_revisions(revisions: &mut [ControllerRevision]) {
    revisions.sort_by(compare_revisions);
}

/// The next revision number following the given revisions, which must be sorted.
pub fn next_revision(revisions: &[ControllerRevision]) -> i64 {
    revisions.last().map(|rev| rev.revision + 1).unwrap_or(1)
}

fn compare_revisions(lhs: &ControllerRevision, rhs: &ControllerRevision) -> Ordering {
    let created = |rev: &ControllerRevision| rev.metadata.creation_timestamp.as_ref().map(|ts| ts.0);
    lhs.revision
        .cmp(&rhs.revision)
        .then_with(|| created(lhs).cmp(&created(rhs)))
        .then_with(|| lhs.metadata.name.cmp(&rhs.metadata.name))
}

/// Record the current spec of the given LeaderWorkerSet in its revision history.
///
/// When the spec is already recorded, the latest equal record is renumbered to the next revision
/// number, unless it already is the latest record.
#[tracing::instrument(level = "debug", skip(store, lws), fields(lws = lws.name()))]
pub async fn create_or_reuse<S: Store + ?Sized>(store: &S, lws: &LeaderWorkerSet, template_hash: &str) -> Result<ControllerRevision> {
    let mut revisions = list_revisions(store, lws, BTreeMap::new()).await?;
    sort_revisions(&mut revisions);

    let candidate = new_revision(lws, next_revision(&revisions), template_hash)?;
    let equal = find_equal_revisions(&revisions, &candidate);
    tracing::debug!(count = equal.len(), "found equal revisions");
    if let (Some(latest_equal), Some(latest)) = (equal.last(), revisions.last()) {
        if equal_revision(latest, latest_equal) {
            return Ok((*latest_equal).clone());
        }
    }
    if let Some(latest_equal) = equal.last() {
        return update_revision_number(store, latest_equal, candidate.revision).await;
    }
    create_revision(store, lws, candidate).await
}

/// Create the given revision, re-hashing its name on collisions with revisions of other content.
///
/// An existing revision with the same name and content is returned as is.
pub async fn create_revision<S: Store + ?Sized>(store: &S, lws: &LeaderWorkerSet, revision: ControllerRevision) -> Result<ControllerRevision> {
    let data = revision_data(&revision);
    let mut collision_count = 0;
    loop {
        let hash = hash_revision(&data, collision_count)?;
        let mut candidate = revision.clone();
        candidate.metadata.name = Some(revision_name(lws.name(), &hash));
        candidate
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL_REVISION_HASH.to_string(), hash);

        let err = match store.create_revision(&candidate).await {
            Ok(created) => {
                tracing::debug!(name = ?created.metadata.name, revision = created.revision, "created new revision");
                return Ok(created);
            }
            Err(err) => err,
        };
        if !matches!(err.downcast_ref::<AppError>(), Some(AppError::AlreadyExists(_))) {
            return Err(err);
        }

        let name = candidate.metadata.name.as_deref().unwrap_or_default();
        if let Some(existing) = store.get_revision(lws.namespace(), name).await? {
            if equal_revision(&existing, &candidate) {
                return Ok(existing);
            }
        }
        collision_count += 1;
        if collision_count > MAX_COLLISIONS {
            return Err(AppError::AlreadyExists(name.into()).into());
        }
        tracing::debug!(%name, collision_count, "revision name collision");
    }
}

/// Set the revision number of the given revision, doing nothing if it already holds that number.
pub async fn update_revision_number<S: Store + ?Sized>(store: &S, revision: &ControllerRevision, number: i64) -> Result<ControllerRevision> {
    if revision.revision == number {
        return Ok(revision.clone());
    }
    let namespace = revision.metadata.namespace.as_deref().unwrap_or_default();
    let name = revision.metadata.name.as_deref().unwrap_or_default();
    store.update_revision_number(namespace, name, number).await
}

/// Delete every revision of the given LeaderWorkerSet except the one recording the given template hash.
///
/// Nothing is deleted unless exactly one revision records the template hash.
#[tracing::instrument(level = "debug", skip(store, lws), fields(lws = lws.name()))]
pub async fn truncate<S: Store + ?Sized>(store: &S, lws: &LeaderWorkerSet, template_hash: &str) -> Result<()> {
    let revisions = list_revisions(store, lws, BTreeMap::new()).await?;
    let current = revision_for_hash(store, lws, template_hash).await?;
    for revision in revisions.iter().filter(|rev| rev.metadata.name != current.metadata.name) {
        let name = revision.metadata.name.as_deref().unwrap_or_default();
        store.delete_revision(lws.namespace(), name).await?;
    }
    Ok(())
}

/// Get the revision of the given LeaderWorkerSet recording the given template hash.
pub async fn revision_for_hash<S: Store + ?Sized>(store: &S, lws: &LeaderWorkerSet, template_hash: &str) -> Result<ControllerRevision> {
    let mut selector = BTreeMap::new();
    selector.insert(LABEL_TEMPLATE_REVISION_HASH.to_string(), template_hash.to_string());
    let mut revisions = list_revisions(store, lws, selector).await?;
    match revisions.len() {
        0 => Err(AppError::RevisionNotFound(template_hash.into()).into()),
        1 => Ok(revisions.remove(0)),
        _ => Err(AppError::DuplicateRevisions(template_hash.into()).into()),
    }
}

/// Check if the given LeaderWorkerSet has any recorded revisions.
pub async fn has_revisions<S: Store + ?Sized>(store: &S, lws: &LeaderWorkerSet) -> Result<bool> {
    Ok(!list_revisions(store, lws, BTreeMap::new()).await?.is_empty())
}

/// List the revisions controlled by the given LeaderWorkerSet which carry the given labels.
async fn list_revisions<S: Store + ?Sized>(
    store: &S, lws: &LeaderWorkerSet, mut selector: BTreeMap<String, String>,
) -> Result<Vec<ControllerRevision>> {
    selector.insert(LABEL_SET_NAME.to_string(), lws.name().to_string());
    let uid = lws.meta().uid.as_deref();
    let revisions = store
        .list_revisions(lws.namespace(), &selector)
        .await
        .context("error listing revisions")?;
    Ok(revisions
        .into_iter()
        .filter(|rev| {
            let controller = rev
                .metadata
                .owner_references
                .iter()
                .flatten()
                .find(|owner| owner.controller == Some(true));
            uid.is_some() && controller.map(|owner| owner.uid.as_str()) == uid
        })
        .collect())
}

fn revision_label<'a>(revision: &'a ControllerRevision, key: &str) -> Option<&'a str> {
    revision.metadata.labels.as_ref().and_then(|labels| labels.get(key)).map(String::as_str)
}

fn revision_data(revision: &ControllerRevision) -> Value {
    revision.data.as_ref().map(|raw| raw.0.clone()).unwrap_or(Value::Null)
}

/// Hash the given revision content, mixing in the collision count when non-zero.
pub fn hash_revision(data: &Value, collision_count: u32) -> Result<String> {
    let bytes = serde_json::to_vec(data).context("error serializing revision data")?;
    let mut hasher = seahash::SeaHasher::default();
    hasher.write(&bytes);
    if collision_count > 0 {
        hasher.write_u32(collision_count);
    }
    Ok(safe_encode(&hasher.finish().to_string()))
}

/// Build the name of a revision from its owner's name and its content hash.
pub fn revision_name(prefix: &str, hash: &str) -> String {
    let mut end = prefix.len().min(MAX_NAME_PREFIX);
    while !prefix.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}-{}", &prefix[..end], hash)
}

fn safe_encode(val: &str) -> String {
    val.bytes()
        .map(|byte| SAFE_ALPHABET[byte as usize % SAFE_ALPHABET.len()] as char)
        .collect()
}
