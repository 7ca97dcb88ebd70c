//! Well-known metadata keys shared by the controller and anything that
//! inspects synced objects.

/// Finalizer placed on every `SyncSource` so target cleanup runs before the
/// source disappears.
pub const FINALIZER: &str = "oaas.io/syncer-finalizer";

/// Label carrying the UID of the owning `SyncSource`. Informers select on
/// its presence.
pub const OWNER_LABEL: &str = "oaas.io/sync-owner";

/// Annotation carrying `<namespace>/<name>` of the owning `SyncSource`.
pub const SOURCE_ANNOTATION: &str = "oaas.io/sync-source";

/// Annotation listing (comma separated) the label keys set by the
/// controller, so keys dropped from the source spec can be removed.
pub const MANAGED_LABELS_ANNOTATION: &str = "oaas.io/sync-managed-labels";

pub const API_GROUP: &str = "oaas.io";
pub const API_VERSION: &str = "oaas.io/v1alpha1";
