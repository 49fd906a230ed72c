//! KV bucket wrapper with injectable failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use keel_core::error::{Error, Result};
use keel_core::kv::{KvEntry, KvStore, WritePrecondition, WriteResult};

/// Record of a bucket operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Read a key.
    Get {
        /// Key that was read.
        key: String,
    },
    /// Conditional write.
    Put {
        /// Key that was written.
        key: String,
        /// Precondition used.
        precondition: WritePrecondition,
    },
    /// Delete a key.
    Delete {
        /// Key that was deleted.
        key: String,
    },
}

/// Wraps a bucket and fails chosen operations on demand.
///
/// Each `fail_*` call makes the next `n` operations of that kind return a
/// storage error without reaching the inner bucket.
pub struct FlakyKv {
    inner: Arc<dyn KvStore>,
    fail_gets: AtomicUsize,
    fail_puts: AtomicUsize,
    fail_deletes: AtomicUsize,
    operations: Mutex<Vec<KvOp>>,
}

impl std::fmt::Debug for FlakyKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyKv")
            .field("bucket", &self.inner.bucket())
            .field("fail_gets", &self.fail_gets)
            .field("fail_puts", &self.fail_puts)
            .field("fail_deletes", &self.fail_deletes)
            .finish_non_exhaustive()
    }
}

impl FlakyKv {
    /// Wraps `inner` with no failures armed.
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            fail_gets: AtomicUsize::new(0),
            fail_puts: AtomicUsize::new(0),
            fail_deletes: AtomicUsize::new(0),
            operations: Mutex::new(Vec::new()),
        }
    }

    /// Fails the next `n` reads.
    pub fn fail_gets(&self, n: usize) {
        self.fail_gets.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` writes, including creates.
    pub fn fail_puts(&self, n: usize) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` deletes.
    pub fn fail_deletes(&self, n: usize) {
        self.fail_deletes.store(n, Ordering::SeqCst);
    }

    /// Returns every operation attempted, failed ones included.
    pub fn operations(&self) -> Vec<KvOp> {
        self.operations.lock().expect("operations lock").clone()
    }

    /// Returns the wrapped bucket.
    pub fn inner(&self) -> &Arc<dyn KvStore> {
        &self.inner
    }

    fn record(&self, op: KvOp) {
        self.operations.lock().expect("operations lock").push(op);
    }

    fn check(counter: &AtomicUsize, what: &str, key: &str) -> Result<()> {
        let armed = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if armed.is_ok() {
            return Err(Error::storage(format!("injected {what} failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FlakyKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        self.record(KvOp::Get {
            key: key.to_string(),
        });
        Self::check(&self.fail_gets, "get", key)?;
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.record(KvOp::Put {
            key: key.to_string(),
            precondition,
        });
        Self::check(&self.fail_puts, "put", key)?;
        self.inner.put(key, value, precondition).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.record(KvOp::Delete {
            key: key.to_string(),
        });
        Self::check(&self.fail_deletes, "delete", key)?;
        self.inner.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys(prefix).await
    }

    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    fn ttl(&self) -> Duration {
        self.inner.ttl()
    }
}
