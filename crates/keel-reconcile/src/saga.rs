//! Ordered multi-step operations with reverse-order compensation.
//!
//! An [`Operations`] list holds named steps, each a pair of async actions:
//! `create` brings a resource into existence and `delete` tears it down.
//!
//! - [`Operations::create`] runs every `create` in insertion order. On the
//!   first failure, the `delete` of each step that already succeeded is
//!   invoked in reverse order before the error is returned.
//! - [`Operations::delete`] runs every `delete` in insertion order, treating
//!   [`StepError::NotFound`] as already done.
//!
//! ```rust
//! use keel_reconcile::saga::{Operations, StepError};
//!
//! # async fn example() -> Result<(), keel_reconcile::saga::SagaError> {
//! let mut ops = Operations::new();
//! ops.append_operation(
//!     "network",
//!     || async { Ok(()) },
//!     || async { Err(StepError::not_found("network")) },
//! );
//! ops.create().await?;
//! ops.delete().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use tracing::Instrument;

use keel_core::observability::saga_step_span;

/// Boxed error carried by a failed step.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a step action.
pub type StepFuture = BoxFuture<'static, Result<(), StepError>>;

type Action = Box<dyn Fn() -> StepFuture + Send + Sync>;

/// Failure of a single step action.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The resource the step manages does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The step failed.
    #[error(transparent)]
    Failed(BoxError),
}

impl StepError {
    /// Wraps any error (or message) as a step failure.
    #[must_use]
    pub fn failed(error: impl Into<BoxError>) -> Self {
        Self::Failed(error.into())
    }

    /// Creates a not-found step error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Returns true for [`StepError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A `delete` action that failed while compensating or tearing down.
#[derive(Debug)]
pub struct StepFailure {
    /// Name of the step.
    pub step: String,
    /// Why it failed.
    pub error: StepError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

fn join_failures(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors returned by [`Operations`].
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    /// A `create` action failed; earlier steps were compensated.
    #[error("operation step {step:?} failed: {source}")]
    StepFailed {
        /// Name of the failing step.
        step: String,
        /// Cause reported by the step.
        #[source]
        source: StepError,
        /// Compensating deletes that also failed.
        compensation_failures: Vec<StepFailure>,
    },

    /// One or more `delete` actions failed during teardown.
    #[error("teardown failed: {}", join_failures(.failures))]
    TeardownFailed {
        /// Every failed delete, in execution order.
        failures: Vec<StepFailure>,
    },
}

impl SagaError {
    /// Returns the name of the step whose `create` failed, if any.
    #[must_use]
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } => Some(step),
            Self::TeardownFailed { .. } => None,
        }
    }
}

struct Step {
    name: String,
    create: Action,
    delete: Action,
}

/// An ordered list of reversible steps.
#[derive(Default)]
pub struct Operations {
    steps: Vec<Step>,
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operations")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl Operations {
    /// Creates an empty operation list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    pub fn append_operation<C, CF, D, DF>(
        &mut self,
        name: impl Into<String>,
        create: C,
        delete: D,
    ) -> &mut Self
    where
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<(), StepError>> + Send + 'static,
        D: Fn() -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            create: Box::new(move || -> StepFuture { Box::pin(create()) }),
            delete: Box::new(move || -> StepFuture { Box::pin(delete()) }),
        });
        self
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if there are no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns step names in insertion order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Runs every `create` in order, compensating on the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::StepFailed`] naming the failing step. Steps after
    /// it never run; steps before it have had their `delete` invoked in
    /// reverse order.
    pub async fn create(&self) -> Result<(), SagaError> {
        for (index, step) in self.steps.iter().enumerate() {
            let result = (step.create)()
                .instrument(saga_step_span(&step.name, "create"))
                .await;

            if let Err(source) = result {
                tracing::warn!(step = %step.name, error = %source, "operation step failed; compensating");
                let compensation_failures = Self::compensate(&self.steps[..index]).await;
                return Err(SagaError::StepFailed {
                    step: step.name.clone(),
                    source,
                    compensation_failures,
                });
            }
        }
        Ok(())
    }

    /// Runs every `delete` in order.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::TeardownFailed`] if any delete failed with
    /// something other than not-found. Every delete is attempted.
    pub async fn delete(&self) -> Result<(), SagaError> {
        let mut failures = Vec::new();
        for step in &self.steps {
            match (step.delete)()
                .instrument(saga_step_span(&step.name, "delete"))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!(step = %step.name, "resource already gone");
                }
                Err(error) => failures.push(StepFailure {
                    step: step.name.clone(),
                    error,
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SagaError::TeardownFailed { failures })
        }
    }

    async fn compensate(completed: &[Step]) -> Vec<StepFailure> {
        let mut failures = Vec::new();
        for step in completed.iter().rev() {
            match (step.delete)()
                .instrument(saga_step_span(&step.name, "compensate"))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(error) => {
                    tracing::warn!(step = %step.name, error = %error, "compensation failed");
                    failures.push(StepFailure {
                        step: step.name.clone(),
                        error,
                    });
                }
            }
        }
        failures
    }
}
