//! # keel-test-utils
//!
//! Shared test utilities for keel integration tests.
//!
//! This crate provides:
//! - **Fixtures**: A ready-made reconcilable object type
//! - **Handlers**: A scripted handler that records every call
//! - **KV**: A bucket wrapper with injectable failures
//! - **Harness**: A fully wired reconciler over in-memory collaborators
//!
//! ## Usage
//!
//! Add to your crate's `[dev-dependencies]`:
//! ```toml
//! keel-test-utils = { workspace = true }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

pub mod fixtures;
pub mod handler;
pub mod harness;
pub mod kv;

pub use fixtures::*;
pub use handler::*;
pub use harness::*;
pub use kv::*;

/// Initialize test logging with tracing-subscriber.
///
/// Call this at the start of tests that need log output. Safe to call
/// from every test: only the first call installs a subscriber.
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("keel_reconcile=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
