//! Key-value bucket abstraction used for coordination state.
//!
//! Lock entries live in named buckets. The contract mirrors what KV layers on
//! top of message brokers provide:
//! - Conditional writes, in particular atomic create-if-absent
//! - Per-entry revisions for compare-and-swap
//! - A bucket-wide TTL after which entries are reaped even if never deleted
//!
//! Buckets are bound idempotently: [`KvProvider::bind_bucket`] returns the
//! existing bucket when one with the same name is already present.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Default TTL for lock buckets (20 minutes).
pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(20 * 60);

/// Precondition for conditional writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the key does not exist (or has expired).
    DoesNotExist,
    /// Write only if the key's revision matches.
    MatchesRevision(u64),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns the new revision.
    Success {
        /// The revision assigned to the written value.
        revision: u64,
    },
    /// Precondition failed, returns the current revision.
    PreconditionFailed {
        /// The revision that caused the precondition to fail (0 if absent).
        current_revision: u64,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A live entry read from a bucket.
#[derive(Debug, Clone)]
pub struct KvEntry {
    /// Entry key.
    pub key: String,
    /// Stored value.
    pub value: Bytes,
    /// Revision of this value.
    pub revision: u64,
    /// When this value was written.
    pub written_at: DateTime<Utc>,
}

/// Configuration used when binding a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    /// Bucket name, typically one per domain area.
    pub name: String,
    /// Entry TTL; entries older than this are reaped.
    pub ttl: Duration,
}

impl BucketConfig {
    /// Creates a bucket config with the default 20 minute TTL.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: DEFAULT_BUCKET_TTL,
        }
    }

    /// Overrides the entry TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// A single KV bucket.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; one bucket handle is shared by every
/// worker of every reconciler in the domain area.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Reads a live entry. Returns `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Writes with a precondition.
    ///
    /// Never returns an error for a failed precondition - that is a normal
    /// [`WriteResult::PreconditionFailed`] result.
    async fn put(&self, key: &str, value: Bytes, precondition: WritePrecondition)
        -> Result<WriteResult>;

    /// Atomically creates a key, failing if a live entry is present.
    async fn create(&self, key: &str, value: Bytes) -> Result<WriteResult> {
        self.put(key, value, WritePrecondition::DoesNotExist).await
    }

    /// Deletes a key. Succeeds even if the key does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists live keys with the given prefix, in arbitrary order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Returns the bucket name.
    fn bucket(&self) -> &str;

    /// Returns the bucket's entry TTL.
    fn ttl(&self) -> Duration;
}

/// Binds named buckets, creating them if missing.
#[async_trait]
pub trait KvProvider: Send + Sync {
    /// Binds a bucket, creating it if it does not exist yet.
    async fn bind_bucket(&self, config: BucketConfig) -> Result<Arc<dyn KvStore>>;
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "kv lock poisoned".into(),
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Bytes,
    revision: u64,
    written_at: DateTime<Utc>,
}

/// In-memory KV bucket for testing and local development.
///
/// Expired entries are reaped lazily on access. Not suitable for production:
/// state is lost on exit and is not shared across processes.
#[derive(Debug)]
pub struct MemoryBucket {
    name: String,
    ttl: Duration,
    entries: RwLock<HashMap<String, StoredEntry>>,
    next_revision: RwLock<u64>,
}

impl MemoryBucket {
    /// Creates an empty bucket.
    #[must_use]
    pub fn new(config: BucketConfig) -> Self {
        Self {
            name: config.name,
            ttl: config.ttl,
            entries: RwLock::new(HashMap::new()),
            next_revision: RwLock::new(1),
        }
    }

    fn is_expired(&self, entry: &StoredEntry, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        entry.written_at + ttl <= now
    }

    fn bump_revision(&self) -> Result<u64> {
        let mut next = self.next_revision.write().map_err(poison_err)?;
        let revision = *next;
        *next += 1;
        Ok(revision)
    }

    /// Returns the number of live entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.values().filter(|e| !self.is_expired(e, now)).count())
    }

    /// Returns true if the bucket holds no live entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl KvStore for MemoryBucket {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries
            .get(key)
            .filter(|e| !self.is_expired(e, now))
            .map(|e| KvEntry {
                key: key.to_string(),
                value: e.value.clone(),
                revision: e.revision,
                written_at: e.written_at,
            }))
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let now = Utc::now();
        let mut entries = self.entries.write().map_err(poison_err)?;

        if entries.get(key).is_some_and(|e| self.is_expired(e, now)) {
            entries.remove(key);
        }
        let current = entries.get(key).map(|e| e.revision);

        match (precondition, current) {
            (WritePrecondition::DoesNotExist, Some(revision)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_revision: revision,
                });
            }
            (WritePrecondition::MatchesRevision(expected), current)
                if current != Some(expected) =>
            {
                return Ok(WriteResult::PreconditionFailed {
                    current_revision: current.unwrap_or(0),
                });
            }
            _ => {}
        }

        let revision = self.bump_revision()?;
        entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                revision,
                written_at: now,
            },
        );
        drop(entries);

        Ok(WriteResult::Success { revision })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().map_err(poison_err)?.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !self.is_expired(e, now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn bucket(&self) -> &str {
        &self.name
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// In-memory bucket registry.
#[derive(Debug, Default)]
pub struct MemoryKv {
    buckets: RwLock<HashMap<String, Arc<MemoryBucket>>>,
}

impl MemoryKv {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a previously bound bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn bucket(&self, name: &str) -> Result<Option<Arc<MemoryBucket>>> {
        Ok(self.buckets.read().map_err(poison_err)?.get(name).cloned())
    }
}

#[async_trait]
impl KvProvider for MemoryKv {
    async fn bind_bucket(&self, config: BucketConfig) -> Result<Arc<dyn KvStore>> {
        let mut buckets = self.buckets.write().map_err(poison_err)?;
        if let Some(existing) = buckets.get(&config.name) {
            if existing.ttl != config.ttl {
                tracing::debug!(
                    bucket = %config.name,
                    existing_ttl_secs = existing.ttl.as_secs(),
                    requested_ttl_secs = config.ttl.as_secs(),
                    "bucket already bound with a different TTL; keeping existing"
                );
            }
            let bound: Arc<dyn KvStore> = existing.clone();
            return Ok(bound);
        }
        let bucket = Arc::new(MemoryBucket::new(config.clone()));
        buckets.insert(config.name, bucket.clone());
        drop(buckets);
        let bound: Arc<dyn KvStore> = bucket;
        Ok(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> MemoryBucket {
        MemoryBucket::new(BucketConfig::new("test"))
    }

    #[tokio::test]
    async fn create_fails_when_key_exists() -> Result<()> {
        let kv = bucket();
        let first = kv.create("R.1", Bytes::from_static(b"a")).await?;
        let second = kv.create("R.1", Bytes::from_static(b"b")).await?;

        assert!(first.is_success());
        assert!(matches!(second, WriteResult::PreconditionFailed { .. }));

        let entry = kv.get("R.1").await?.expect("entry present");
        assert_eq!(entry.value, Bytes::from_static(b"a"));
        Ok(())
    }

    #[tokio::test]
    async fn matches_revision_guards_updates() -> Result<()> {
        let kv = bucket();
        let WriteResult::Success { revision } = kv.create("k", Bytes::new()).await? else {
            panic!("create should succeed");
        };

        let stale = kv
            .put("k", Bytes::new(), WritePrecondition::MatchesRevision(revision + 10))
            .await?;
        assert!(!stale.is_success());

        let fresh = kv
            .put("k", Bytes::new(), WritePrecondition::MatchesRevision(revision))
            .await?;
        assert!(fresh.is_success());
        Ok(())
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() -> Result<()> {
        let kv = MemoryBucket::new(BucketConfig::new("short").with_ttl(Duration::from_millis(5)));
        kv.create("R.9", Bytes::new()).await?;
        assert!(kv.get("R.9").await?.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(kv.get("R.9").await?.is_none());
        assert!(kv.create("R.9", Bytes::new()).await?.is_success());
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> Result<()> {
        let kv = bucket();
        kv.delete("missing").await?;
        kv.create("present", Bytes::new()).await?;
        kv.delete("present").await?;
        assert!(kv.get("present").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn keys_filters_by_prefix() -> Result<()> {
        let kv = bucket();
        kv.create("Workload.1", Bytes::new()).await?;
        kv.create("Workload.2", Bytes::new()).await?;
        kv.create("Gateway.1", Bytes::new()).await?;

        let mut keys = kv.keys("Workload.").await?;
        keys.sort();
        assert_eq!(keys, vec!["Workload.1", "Workload.2"]);
        Ok(())
    }

    #[tokio::test]
    async fn bind_bucket_is_idempotent() -> Result<()> {
        let kv = MemoryKv::new();
        let a = kv.bind_bucket(BucketConfig::new("runtime")).await?;
        a.create("x", Bytes::new()).await?;

        let b = kv.bind_bucket(BucketConfig::new("runtime")).await?;
        assert!(b.get("x").await?.is_some());
        assert_eq!(b.ttl(), DEFAULT_BUCKET_TTL);
        Ok(())
    }
}
