//! # keel-core
//!
//! Core abstractions shared by every keel reconciler process.
//!
//! This crate provides the foundational types used across keel components:
//!
//! - **Identifiers**: Opaque object IDs and generated worker IDs
//! - **KV Buckets**: Create-if-absent key-value storage with bucket TTL
//! - **Object Locks**: Per-object mutual exclusion built on KV buckets
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use keel_core::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let kv = MemoryKv::new();
//! let bucket = kv.bind_bucket(BucketConfig::new("workloads")).await?;
//! let lock = ObjectLock::new(bucket, "WorkloadReconciler", WorkerId::generate());
//!
//! let id = ObjectId::from(42_u64);
//! assert!(lock.try_acquire(&id).await?);
//! assert!(lock.release(&id).await);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod kv;
pub mod lock;
pub mod observability;

pub use error::{Error, Result};
pub use id::{ObjectId, WorkerId};
pub use kv::{
    BucketConfig, KvEntry, KvProvider, KvStore, MemoryBucket, MemoryKv, WritePrecondition,
    WriteResult,
};
pub use lock::{LockCheck, LockInfo, ObjectLock};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ObjectId, WorkerId};
    pub use crate::kv::{
        BucketConfig, KvEntry, KvProvider, KvStore, MemoryBucket, MemoryKv, WritePrecondition,
        WriteResult,
    };
    pub use crate::lock::{LockCheck, LockInfo, ObjectLock};
}
