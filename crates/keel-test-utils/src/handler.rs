//! A scripted reconcile handler that records its calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use keel_core::ObjectId;
use keel_reconcile::events::EventSpec;
use keel_reconcile::handler::{HandlerError, HandlerResult, Outcome, ReconcileHandler};
use keel_reconcile::notification::Operation;
use keel_reconcile::object::Reconcilable;

/// What the handler does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return `Done`.
    Succeed,
    /// Fail with the given message.
    Fail(String),
    /// Fail with the given message and event override.
    FailWithEvent(String, EventSpec),
    /// Ask to be requeued after the delay.
    Requeue(Duration),
    /// Sleep, then return `Done`.
    Sleep(Duration),
}

/// One recorded handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCall {
    /// Which callback ran.
    pub operation: Operation,
    /// Object it ran for.
    pub object_id: ObjectId,
}

/// Handler that plays back a script, then falls back to a default step.
#[derive(Debug)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<HandlerCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self::always(Step::Succeed)
    }
}

impl ScriptedHandler {
    /// Creates a handler that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler that runs `step` on every call.
    pub fn always(step: Step) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: step,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Queues steps to run before the fallback.
    #[must_use]
    pub fn then(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().expect("script lock").extend(steps);
        self
    }

    /// Returns every recorded call.
    pub fn calls(&self) -> Vec<HandlerCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Returns how many times `operation` ran.
    pub fn count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Returns the total number of calls.
    pub fn total(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    /// Returns the highest number of calls observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn run(&self, operation: Operation, object_id: ObjectId) -> HandlerResult {
        self.calls
            .lock()
            .expect("calls lock")
            .push(HandlerCall {
                operation,
                object_id,
            });
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = match step {
            Step::Succeed => Ok(Outcome::Done),
            Step::Fail(message) => Err(HandlerError::new(message)),
            Step::FailWithEvent(message, event) => Err(HandlerError::new(message).with_event(event)),
            Step::Requeue(delay) => Ok(Outcome::RequeueAfter(delay)),
            Step::Sleep(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Outcome::Done)
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl<T: Reconcilable> ReconcileHandler<T> for ScriptedHandler {
    async fn created(&self, object: &T) -> HandlerResult {
        self.run(Operation::Created, object.object_id()).await
    }

    async fn updated(&self, object: &T) -> HandlerResult {
        self.run(Operation::Updated, object.object_id()).await
    }

    async fn deleted(&self, object: &T) -> HandlerResult {
        self.run(Operation::Deleted, object.object_id()).await
    }
}
