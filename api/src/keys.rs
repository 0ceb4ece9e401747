//! Keys holds the label and annotation names the controller owns.
//!
//! Every key lives under the `projectmirror.io/` prefix. The values here are
//! part of the on-cluster contract: mirrors written by one controller version
//! must stay recognizable to the next.

/// ENABLED_LABEL marks an object as a mirroring source. Watches are filtered
/// server-side on this label.
pub const ENABLED_LABEL: &str = "projectmirror.io/enabled";

/// MANAGED_BY_LABEL is stamped on every mirror with the controller's name.
pub const MANAGED_BY_LABEL: &str = "projectmirror.io/managed-by";

/// MIRROR_LABEL marks an object as a mirror (value `"true"`).
pub const MIRROR_LABEL: &str = "projectmirror.io/mirror";

/// ALLOW_MIRRORS_LABEL is the per-namespace opt-in (`"true"`) or opt-out
/// (`"false"`) switch.
pub const ALLOW_MIRRORS_LABEL: &str = "projectmirror.io/allow-mirrors";

/// SYNC_ANNOTATION must be `"true"` on a source for mirroring to proceed.
pub const SYNC_ANNOTATION: &str = "projectmirror.io/sync";

/// TARGET_NAMESPACES_ANNOTATION is a CSV of namespace globs or the sentinels
/// [`ALL_NAMESPACES`] / [`ALL_LABELED_NAMESPACES`].
pub const TARGET_NAMESPACES_ANNOTATION: &str = "projectmirror.io/target-namespaces";

/// EXCLUDE_ANNOTATION is a CSV of globs subtracted from the resolved target
/// set.
pub const EXCLUDE_ANNOTATION: &str = "projectmirror.io/exclude";

/// TRANSFORM_ANNOTATION carries the YAML rule list applied to mirror
/// payloads.
pub const TRANSFORM_ANNOTATION: &str = "projectmirror.io/transform";

/// TRANSFORM_STRICT_ANNOTATION switches the source to strict transform
/// handling when `"true"`.
pub const TRANSFORM_STRICT_ANNOTATION: &str = "projectmirror.io/transform-strict";

/// SOURCE_NAMESPACE_ANNOTATION records the source namespace on a mirror.
pub const SOURCE_NAMESPACE_ANNOTATION: &str = "projectmirror.io/source-namespace";

/// SOURCE_NAME_ANNOTATION records the source name on a mirror.
pub const SOURCE_NAME_ANNOTATION: &str = "projectmirror.io/source-name";

/// SOURCE_UID_ANNOTATION records the source uid on a mirror. A uid mismatch
/// means the source was recreated and the mirror is stale.
pub const SOURCE_UID_ANNOTATION: &str = "projectmirror.io/source-uid";

/// SOURCE_GENERATION_ANNOTATION records the source generation observed at the
/// last sync, when the source reports one.
pub const SOURCE_GENERATION_ANNOTATION: &str = "projectmirror.io/source-generation";

/// SOURCE_CONTENT_HASH_ANNOTATION records the content hash of the source
/// payload at the last sync.
pub const SOURCE_CONTENT_HASH_ANNOTATION: &str = "projectmirror.io/source-content-hash";

/// SOURCE_RESOURCE_VERSION_ANNOTATION records the source resourceVersion at
/// the last sync.
pub const SOURCE_RESOURCE_VERSION_ANNOTATION: &str = "projectmirror.io/source-resource-version";

/// LAST_SYNC_TIME_ANNOTATION is the RFC3339 timestamp of the last sync.
pub const LAST_SYNC_TIME_ANNOTATION: &str = "projectmirror.io/last-sync-time";

/// SYNC_STATUS_ANNOTATION summarizes the last reconcile on the source,
/// formatted `reconciled:N,errors:M`.
pub const SYNC_STATUS_ANNOTATION: &str = "projectmirror.io/sync-status";

/// FAILED_TARGETS_ANNOTATION lists the namespaces that errored during the
/// last reconcile, sorted, CSV.
pub const FAILED_TARGETS_ANNOTATION: &str = "projectmirror.io/failed-targets";

/// WEBHOOK_ERROR_ANNOTATION is written by the (external) admission surface;
/// the core only knows to strip it from mirrors.
pub const WEBHOOK_ERROR_ANNOTATION: &str = "projectmirror.io/webhook-error";

/// DELETION_ATTEMPTS_ANNOTATION counts cleanup passes that hit per-namespace
/// failures.
pub const DELETION_ATTEMPTS_ANNOTATION: &str = "projectmirror.io/deletion-attempts";

/// FINALIZER is appended to managed sources so deletion is observed before
/// the object goes away.
pub const FINALIZER: &str = "projectmirror.io/finalizer";

/// TRUE_VALUE is the canonical affirmative label/annotation value.
pub const TRUE_VALUE: &str = "true";

/// FALSE_VALUE is the canonical negative label/annotation value.
pub const FALSE_VALUE: &str = "false";

/// ALL_NAMESPACES selects every namespace passing the filter.
pub const ALL_NAMESPACES: &str = "all";

/// ALL_LABELED_NAMESPACES selects every opted-in namespace.
pub const ALL_LABELED_NAMESPACES: &str = "all-labeled";

/// SOURCE_BACKREF_ANNOTATIONS are the annotations every mirror must carry.
pub const SOURCE_BACKREF_ANNOTATIONS: [&str; 5] = [
    SOURCE_NAMESPACE_ANNOTATION,
    SOURCE_NAME_ANNOTATION,
    SOURCE_UID_ANNOTATION,
    SOURCE_CONTENT_HASH_ANNOTATION,
    LAST_SYNC_TIME_ANNOTATION,
];

/// CONTROLLER_KEYS are every label and annotation in the controller's space.
/// The mirror builder strips these from copied source metadata.
pub const CONTROLLER_KEYS: [&str; 20] = [
    ENABLED_LABEL,
    MANAGED_BY_LABEL,
    MIRROR_LABEL,
    ALLOW_MIRRORS_LABEL,
    SYNC_ANNOTATION,
    TARGET_NAMESPACES_ANNOTATION,
    EXCLUDE_ANNOTATION,
    TRANSFORM_ANNOTATION,
    TRANSFORM_STRICT_ANNOTATION,
    SOURCE_NAMESPACE_ANNOTATION,
    SOURCE_NAME_ANNOTATION,
    SOURCE_UID_ANNOTATION,
    SOURCE_GENERATION_ANNOTATION,
    SOURCE_CONTENT_HASH_ANNOTATION,
    SOURCE_RESOURCE_VERSION_ANNOTATION,
    LAST_SYNC_TIME_ANNOTATION,
    SYNC_STATUS_ANNOTATION,
    FAILED_TARGETS_ANNOTATION,
    WEBHOOK_ERROR_ANNOTATION,
    DELETION_ATTEMPTS_ANNOTATION,
];
