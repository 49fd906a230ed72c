//! The capability every reconciled object type provides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::ObjectId;

/// A domain object the engine can reconcile.
///
/// The engine never inspects anything else about `T`; business logic lives
/// in the handler.
pub trait Reconcilable: Send + Sync + 'static {
    /// Stable identifier of the object.
    fn object_id(&self) -> ObjectId;

    /// Object type tag (e.g. `Workload`).
    fn type_tag(&self) -> &str;

    /// Schema version tag of the object.
    fn version_tag(&self) -> &str;

    /// When deletion was requested, if it was.
    fn deletion_scheduled(&self) -> Option<DateTime<Utc>>;

    /// When deletion was confirmed by a reconciler, if it was.
    fn deletion_confirmed(&self) -> Option<DateTime<Utc>>;

    /// Whether the current desired state has been reconciled.
    fn is_reconciled(&self) -> bool;

    /// Applies a reconciliation update in place.
    fn apply_reconciliation(&mut self, update: &ReconciliationUpdate);
}

/// Reconciliation status fields written back to the canonical store.
///
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReconciliationUpdate {
    /// New value of the `Reconciled` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<bool>,
    /// When the reconciler acknowledged the deletion request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_acknowledged: Option<DateTime<Utc>>,
    /// When the reconciler finished tearing the object down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_confirmed: Option<DateTime<Utc>>,
}

impl ReconciliationUpdate {
    /// Marks the object reconciled.
    #[must_use]
    pub fn reconciled() -> Self {
        Self {
            reconciled: Some(true),
            ..Self::default()
        }
    }

    /// Marks the deletion acknowledged and confirmed at `at`.
    #[must_use]
    pub fn deletion_confirmed_at(at: DateTime<Utc>) -> Self {
        Self {
            reconciled: Some(true),
            deletion_acknowledged: Some(at),
            deletion_confirmed: Some(at),
        }
    }
}
