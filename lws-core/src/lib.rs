pub mod crd;
pub mod error;

pub use error::AppError;

/// Label carrying the name of the LeaderWorkerSet a pod belongs to.
pub const LABEL_SET_NAME: &str = "leaderworkerset.sigs.k8s.io/name";
/// Label carrying a pod's index within its group, where the leader is always `0`.
pub const LABEL_WORKER_INDEX: &str = "leaderworkerset.sigs.k8s.io/worker-index";
/// Label carrying the index of a group within its LeaderWorkerSet.
pub const LABEL_GROUP_INDEX: &str = "leaderworkerset.sigs.k8s.io/group-index";
/// Label carrying a hash unique to one group instance.
pub const LABEL_GROUP_UNIQUE_HASH: &str = "leaderworkerset.sigs.k8s.io/group-key";
/// Label carrying the hash of the template revision a pod was created from.
pub const LABEL_TEMPLATE_REVISION_HASH: &str = "leaderworkerset.sigs.k8s.io/template-revision-hash";

/// Annotation on a LeaderWorkerSet naming the node label used for exclusive placement.
pub const ANNOTATION_EXCLUSIVE_KEY: &str = "leaderworkerset.sigs.k8s.io/exclusive-topology";
/// Annotation naming the node label used for exclusive placement of sub-groups.
pub const ANNOTATION_SUBGROUP_EXCLUSIVE_KEY: &str = "leaderworkerset.sigs.k8s.io/subgroup-exclusive-topology";
/// Annotation carrying the size of a group.
pub const ANNOTATION_SIZE: &str = "leaderworkerset.sigs.k8s.io/size";
/// Annotation carrying the size of a sub-group.
pub const ANNOTATION_SUBGROUP_SIZE: &str = "leaderworkerset.sigs.k8s.io/subgroup-size";
/// Annotation on worker pods naming their leader pod.
pub const ANNOTATION_LEADER_POD_NAME: &str = "leaderworkerset.sigs.k8s.io/leader-name";
/// Annotation marking a group whose leader requests TPUs.
pub const ANNOTATION_LEADER_REQUESTS_TPUS: &str = "leaderworkerset.sigs.k8s.io/leader-requests-tpus";
/// Annotation on a worker StatefulSet carrying the hash of the document it was last applied from.
pub const ANNOTATION_WORKER_CONFIG_HASH: &str = "leaderworkerset.sigs.k8s.io/worker-config-hash";

/// The extended resource name of TPU accelerators.
pub const RESOURCE_TPU: &str = "google.com/tpu";

/// The worker index value which identifies a leader pod.
pub const LEADER_WORKER_INDEX: &str = "0";
