//! Client boundary to the canonical object store.
//!
//! The canonical store is the only authoritative record of domain objects.
//! Reconcilers read the latest state by ID and write back reconciliation
//! status; they never trust the copy embedded in a notification.
//!
//! Every method reports a missing object as [`Error::NotFound`](crate::Error::NotFound)
//! so callers can branch on [`Error::is_not_found`](crate::Error::is_not_found).

pub mod memory;

use async_trait::async_trait;

use keel_core::ObjectId;

use crate::error::Result;
use crate::object::{Reconcilable, ReconciliationUpdate};

/// Canonical store operations used by the engine.
#[async_trait]
pub trait ObjectClient<T: Reconcilable>: Send + Sync + 'static {
    /// Fetches the latest state of an object.
    async fn get_by_id(&self, id: &ObjectId) -> Result<T>;

    /// Writes reconciliation status fields.
    async fn update_reconciliation_fields(
        &self,
        id: &ObjectId,
        update: &ReconciliationUpdate,
    ) -> Result<()>;

    /// Removes an object.
    async fn delete(&self, id: &ObjectId) -> Result<()>;
}
