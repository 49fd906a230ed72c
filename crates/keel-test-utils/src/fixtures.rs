//! Test fixtures for common scenarios.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::ObjectId;
use keel_reconcile::object::{Reconcilable, ReconciliationUpdate};

/// Type tag of [`TestObject`].
pub const TEST_OBJECT_TYPE: &str = "TestObject";

/// Schema version stamped on [`TestObject`] notifications.
pub const TEST_OBJECT_VERSION: &str = "v1";

/// Stream every harness creates.
pub const TEST_STREAM: &str = "CONTROL";

/// Subject [`TestObject`] notifications are published on.
pub const TEST_SUBJECT: &str = "control.testobject";

/// A minimal reconcilable object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestObject {
    /// Object ID.
    pub id: u64,
    /// Schema version tag.
    #[serde(default = "default_version")]
    pub version: String,
    /// Free-form desired state.
    #[serde(default)]
    pub spec: String,
    /// When deletion was requested.
    #[serde(default)]
    pub deletion_scheduled: Option<DateTime<Utc>>,
    /// When deletion was acknowledged.
    #[serde(default)]
    pub deletion_acknowledged: Option<DateTime<Utc>>,
    /// When teardown finished.
    #[serde(default)]
    pub deletion_confirmed: Option<DateTime<Utc>>,
    /// Whether the desired state is reconciled.
    #[serde(default)]
    pub reconciled: bool,
}

fn default_version() -> String {
    TEST_OBJECT_VERSION.to_string()
}

impl TestObject {
    /// Creates an unreconciled object with the default version.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            version: default_version(),
            spec: String::new(),
            deletion_scheduled: None,
            deletion_acknowledged: None,
            deletion_confirmed: None,
            reconciled: false,
        }
    }

    /// Sets the desired state.
    #[must_use]
    pub fn with_spec(mut self, spec: impl Into<String>) -> Self {
        self.spec = spec.into();
        self
    }

    /// Overrides the schema version tag.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Marks the object as scheduled for deletion now.
    #[must_use]
    pub fn scheduled_for_deletion(mut self) -> Self {
        self.deletion_scheduled = Some(Utc::now());
        self
    }
}

impl Reconcilable for TestObject {
    fn object_id(&self) -> ObjectId {
        ObjectId::from(self.id)
    }

    fn type_tag(&self) -> &str {
        TEST_OBJECT_TYPE
    }

    fn version_tag(&self) -> &str {
        &self.version
    }

    fn deletion_scheduled(&self) -> Option<DateTime<Utc>> {
        self.deletion_scheduled
    }

    fn deletion_confirmed(&self) -> Option<DateTime<Utc>> {
        self.deletion_confirmed
    }

    fn is_reconciled(&self) -> bool {
        self.reconciled
    }

    fn apply_reconciliation(&mut self, update: &ReconciliationUpdate) {
        if let Some(reconciled) = update.reconciled {
            self.reconciled = reconciled;
        }
        if update.deletion_acknowledged.is_some() {
            self.deletion_acknowledged = update.deletion_acknowledged;
        }
        if update.deletion_confirmed.is_some() {
            self.deletion_confirmed = update.deletion_confirmed;
        }
    }
}
