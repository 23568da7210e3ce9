//! LeaderWorkerSet error abstractions.

use thiserror::Error;

/// Application error variants.
///
/// These are the error conditions which callers may want to tell apart. All other failures,
/// usually transport errors from the K8s API, are propagated as opaque `anyhow` errors.
#[derive(Debug, Error)]
pub enum AppError {
    /// A pod is missing one of the labels which identify its group.
    #[error("the {label} label is unexpectedly missing from pod {pod}")]
    MissingLabel { pod: String, label: &'static str },
    /// A worker pod's name does not end with an ordinal.
    #[error("could not parse the parent name and ordinal of pod {0}")]
    InvalidPodName(String),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The node hosting a leader pod does not carry the requested topology label.
    #[error("node {node} does not have topology label {key}")]
    MissingTopologyLabel { node: String, key: String },
    /// No revision matches the given template hash.
    #[error("could not find a LeaderWorkerSet revision for template hash {0}")]
    RevisionNotFound(String),
    /// More than one revision matches the given template hash.
    #[error("found more than one revision matching template hash {0}")]
    DuplicateRevisions(String),
    /// An object with the given name already exists.
    #[error("object {0} already exists")]
    AlreadyExists(String),
}
