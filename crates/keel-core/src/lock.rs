//! Per-object distributed lock built on a KV bucket.
//!
//! Each reconciler owns a namespace of lock keys of the form
//! `<reconcilerName>.<objectID>`. The lock relies on a single primitive:
//!
//! - **Create-if-absent**: [`KvStore::create`] succeeds for exactly one caller
//! - **Bucket TTL**: entries are reaped after the bucket TTL (20 minutes by
//!   default), so a holder that dies without releasing only blocks the
//!   object temporarily
//!
//! [`ObjectLock::is_held`] is a non-mutating check used to requeue early
//! without an acquire attempt. It is advisory: between `is_held` and
//! `try_acquire` another worker may win, in which case `try_acquire` reports
//! `false`. Only `try_acquire` decides ownership.
//!
//! # Example
//!
//! ```rust
//! use keel_core::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let kv = MemoryKv::new();
//! let bucket = kv.bind_bucket(BucketConfig::new("gateways")).await?;
//! let lock = ObjectLock::new(bucket, "GatewayReconciler", WorkerId::generate());
//! let id = ObjectId::from(7_u64);
//!
//! if lock.try_acquire(&id).await? {
//!     // Critical section - only one worker in the fleet at a time
//!     lock.release(&id).await;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{ObjectId, WorkerId};
use crate::kv::{KvStore, WriteResult};

/// Lock entry contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Worker that owns the lock.
    pub holder_id: WorkerId,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// When the bucket TTL will reap the entry.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates lock info for a holder, expiring after `ttl`.
    #[must_use]
    pub fn new(holder_id: WorkerId, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id,
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(20)),
        }
    }

    /// Returns whether the TTL has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Outcome of a non-mutating lock check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCheck {
    /// A live lock entry exists.
    Held,
    /// No live lock entry exists.
    Free,
    /// The lock store could not be queried.
    ///
    /// Callers must treat this as held and retry later.
    CheckFailed,
}

impl LockCheck {
    /// Returns true unless the check positively found the lock free.
    #[must_use]
    pub const fn assume_held(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// Per-object mutual exclusion for one reconciler.
pub struct ObjectLock<S: KvStore + ?Sized = dyn KvStore> {
    bucket: Arc<S>,
    reconciler: String,
    holder_id: WorkerId,
}

// Manual Clone implementation to avoid requiring S: Clone
impl<S: KvStore + ?Sized> Clone for ObjectLock<S> {
    fn clone(&self) -> Self {
        Self {
            bucket: Arc::clone(&self.bucket),
            reconciler: self.reconciler.clone(),
            holder_id: self.holder_id,
        }
    }
}

impl<S: KvStore + ?Sized> std::fmt::Debug for ObjectLock<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLock")
            .field("bucket", &self.bucket.bucket())
            .field("reconciler", &self.reconciler)
            .field("holder_id", &self.holder_id)
            .finish()
    }
}

impl<S: KvStore + ?Sized> ObjectLock<S> {
    /// Creates a lock namespace for `reconciler` in `bucket`.
    #[must_use]
    pub fn new(bucket: Arc<S>, reconciler: impl Into<String>, holder_id: WorkerId) -> Self {
        Self {
            bucket,
            reconciler: reconciler.into(),
            holder_id,
        }
    }

    /// Returns the lock key for an object: `<reconcilerName>.<objectID>`.
    #[must_use]
    pub fn key(&self, object_id: &ObjectId) -> String {
        format!("{}.{object_id}", self.reconciler)
    }

    /// Returns the holder ID recorded in acquired entries.
    #[must_use]
    pub const fn holder_id(&self) -> WorkerId {
        self.holder_id
    }

    /// Returns the TTL after which an unreleased lock is reaped.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.bucket.ttl()
    }

    /// Attempts to acquire the lock once.
    ///
    /// Returns `true` if this caller now owns the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store is unreachable. Callers must not
    /// assume ownership on error.
    pub async fn try_acquire(&self, object_id: &ObjectId) -> Result<bool> {
        let info = LockInfo::new(self.holder_id, self.bucket.ttl());
        let bytes = Bytes::from(
            serde_json::to_vec(&info)
                .map_err(|e| Error::serialization(format!("serialize lock: {e}")))?,
        );

        match self.bucket.create(&self.key(object_id), bytes).await? {
            WriteResult::Success { .. } => Ok(true),
            WriteResult::PreconditionFailed { .. } => Ok(false),
        }
    }

    /// Checks whether a live lock entry exists for the object.
    ///
    /// Store failures are reported as [`LockCheck::CheckFailed`], never as
    /// [`LockCheck::Free`].
    pub async fn is_held(&self, object_id: &ObjectId) -> LockCheck {
        let key = self.key(object_id);
        match self.bucket.get(&key).await {
            Ok(Some(_)) => LockCheck::Held,
            Ok(None) => LockCheck::Free,
            Err(e) => {
                tracing::warn!(lock_key = %key, error = %e, "lock check failed");
                LockCheck::CheckFailed
            }
        }
    }

    /// Reads the current lock entry without acquiring it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store is unreachable or the entry is
    /// not valid lock JSON.
    pub async fn read_info(&self, object_id: &ObjectId) -> Result<Option<LockInfo>> {
        let Some(entry) = self.bucket.get(&self.key(object_id)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&entry.value)
            .map(Some)
            .map_err(|e| Error::serialization(format!("parse lock: {e}")))
    }

    /// Releases the lock by deleting its entry, if this worker still holds it.
    ///
    /// An entry owned by another holder (taken after ours was reaped at TTL)
    /// is left in place. Returns `false` if the entry could not be read or
    /// deleted. It then disappears only at TTL expiry; the object stays
    /// locked until then.
    pub async fn release(&self, object_id: &ObjectId) -> bool {
        let key = self.key(object_id);
        match self.read_info(object_id).await {
            Ok(None) => return true,
            Ok(Some(info)) if info.holder_id != self.holder_id => {
                tracing::warn!(
                    lock_key = %key,
                    holder_id = %info.holder_id,
                    "lock was reaped and taken by another holder; leaving it"
                );
                return true;
            }
            Ok(Some(_)) => {}
            Err(e) => {
                tracing::warn!(
                    lock_key = %key,
                    ttl_secs = self.bucket.ttl().as_secs(),
                    error = %e,
                    "lock release failed; entry will be reaped at TTL"
                );
                return false;
            }
        }

        // The entry can still be reaped and retaken between the read and the
        // delete; the bucket has no conditional delete to close that window.
        match self.bucket.delete(&key).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    lock_key = %key,
                    ttl_secs = self.bucket.ttl().as_secs(),
                    error = %e,
                    "lock release failed; entry will be reaped at TTL"
                );
                false
            }
        }
    }
}
