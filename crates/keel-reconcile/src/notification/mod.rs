//! Pull-based, at-least-once notification delivery.
//!
//! This module provides:
//!
//! - [`Notification`]: The JSON payload the canonical store publishes on mutation
//! - [`Delivery`]: One delivery attempt of a broker message
//! - [`NotificationChannel`]: Trait over a durable pull subscription
//! - [`Broker`]: Trait for binding durable consumers to pre-created streams
//! - [`memory::InMemoryBroker`]: In-memory broker for testing
//!
//! ## Topology
//!
//! One stream per domain area, one subject per object type. Each reconciler
//! binds the durable consumer `<ReconcilerName>Consumer` filtered to its
//! subject. Every worker of that reconciler pulls from the same durable
//! consumer, so they compete for messages.

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Delay used when a payload cannot be decoded at all.
pub const RAW_REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// Default time a delivery may stay unacknowledged before redelivery.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Mutation kind carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operation {
    /// The object was created.
    Created,
    /// The object was updated.
    Updated,
    /// The object was scheduled for deletion.
    Deleted,
    /// Any other operation string.
    Unrecognized,
}

impl Operation {
    /// Parses a wire operation string.
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        match value {
            "Created" => Self::Created,
            "Updated" => Self::Updated,
            "Deleted" => Self::Deleted,
            _ => Self::Unrecognized,
        }
    }

    /// Returns the operation as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
            Self::Deleted => "Deleted",
            Self::Unrecognized => "Unrecognized",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&value))
    }
}

/// Change notification published by the canonical store.
///
/// `creation_time` is the epoch second of the original emission. It is the
/// only input to requeue backoff and is never rewritten on redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    /// Mutation kind.
    pub operation: Operation,
    /// Epoch seconds of the original emission.
    pub creation_time: i64,
    /// Schema version tag of the embedded object.
    #[serde(default)]
    pub object_version: String,
    /// The object as of the mutation.
    pub object: serde_json::Value,
}

impl Notification {
    /// Creates a notification for `object`, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if `object` cannot be serialized.
    pub fn new(
        operation: Operation,
        object_version: impl Into<String>,
        object: &impl Serialize,
    ) -> Result<Self> {
        let object = serde_json::to_value(object)
            .map_err(|e| Error::decode(format!("serialize object: {e}")))?;
        Ok(Self {
            operation,
            creation_time: Utc::now().timestamp(),
            object_version: object_version.into(),
            object,
        })
    }

    /// Overrides the emission time.
    #[must_use]
    pub fn with_creation_time(mut self, created_at: DateTime<Utc>) -> Self {
        self.creation_time = created_at.timestamp();
        self
    }

    /// Decodes a notification from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the payload is not a notification.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::decode(format!("notification: {e}")))
    }

    /// Encodes the notification as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if serialization fails.
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::decode(format!("encode notification: {e}")))
    }

    /// Decodes the embedded object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the object does not match `T`.
    pub fn object<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.object).map_err(|e| Error::decode(format!("object: {e}")))
    }

    /// Returns the emission time, or now if it is out of range.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.creation_time, 0).unwrap_or_else(Utc::now)
    }
}

/// One delivery attempt of a broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker message identifier, stable across redeliveries.
    pub message_id: String,
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Delivery attempt, starting at 1.
    pub delivery_count: u32,
}

/// Acknowledgement policy of a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Every message must be acked or nak'd individually.
    #[default]
    Explicit,
}

/// Durable consumer binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Durable consumer name shared by all workers of a reconciler.
    pub durable_name: String,
    /// Stream the consumer reads from.
    pub stream: String,
    /// Subject filter (`*` matches one token, `>` the remainder).
    pub filter_subject: String,
    /// Acknowledgement policy.
    pub ack_policy: AckPolicy,
    /// Time before an unacknowledged delivery is redelivered.
    pub ack_wait: Duration,
}

impl ConsumerConfig {
    /// Creates the consumer binding for a reconciler.
    ///
    /// The durable name is `<reconciler>Consumer`.
    #[must_use]
    pub fn for_reconciler(
        reconciler: &str,
        stream: impl Into<String>,
        filter_subject: impl Into<String>,
    ) -> Self {
        Self {
            durable_name: format!("{reconciler}Consumer"),
            stream: stream.into(),
            filter_subject: filter_subject.into(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }

    /// Sets the ack wait.
    #[must_use]
    pub const fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

/// A durable pull subscription.
///
/// Delivery is at-least-once: a delivery that is neither acked nor nak'd
/// within the consumer's ack wait is delivered again.
#[async_trait]
pub trait NotificationChannel: Send + Sync + 'static {
    /// Waits up to `timeout` for the next message.
    ///
    /// Returns `None` if nothing arrived in time.
    async fn pull(&self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Acknowledges a delivery; it will not be delivered again.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Negatively acknowledges a delivery; it is redelivered after `delay`.
    async fn nak_with_delay(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    /// Requeues an undecodable delivery with the fixed raw delay.
    async fn raw_requeue(&self, delivery: &Delivery) -> Result<()> {
        self.nak_with_delay(delivery, RAW_REQUEUE_DELAY).await
    }

    /// Stops pulling from the subscription.
    async fn unsubscribe(&self) -> Result<()>;

    /// Returns the durable consumer name.
    fn consumer_name(&self) -> &str;
}

/// A broker that can bind durable consumers.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Binds (or re-binds) the durable consumer described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`] if the stream does not exist.
    async fn bind_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<std::sync::Arc<dyn NotificationChannel>>;
}

/// Returns whether `subject` matches a NATS-style `filter`.
#[must_use]
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_pascal_case_payload() {
        let payload = br#"{"Operation":"Created","CreationTime":1700000000,"ObjectVersion":"v1","Object":{"ID":42}}"#;
        let n = Notification::decode(payload).expect("decode");
        assert_eq!(n.operation, Operation::Created);
        assert_eq!(n.creation_time, 1_700_000_000);
        assert_eq!(n.object_version, "v1");
        assert_eq!(n.object, json!({"ID": 42}));
        assert_eq!(n.created_at().timestamp(), 1_700_000_000);
    }

    #[test]
    fn unknown_operation_is_unrecognized_not_a_decode_error() {
        let payload = br#"{"Operation":"Archived","CreationTime":1,"Object":{}}"#;
        let n = Notification::decode(payload).expect("decode");
        assert_eq!(n.operation, Operation::Unrecognized);
        assert!(n.object_version.is_empty());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = Notification::decode(b"not json").expect_err("garbage");
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn encode_uses_wire_keys() {
        let n = Notification::new(Operation::Deleted, "v2", &json!({"ID": 1})).expect("new");
        let value: serde_json::Value = serde_json::from_slice(&n.encode().expect("encode")).expect("json");
        assert_eq!(value["Operation"], "Deleted");
        assert_eq!(value["ObjectVersion"], "v2");
        assert!(value["CreationTime"].is_i64());
    }

    #[test]
    fn consumer_name_follows_reconciler() {
        let config = ConsumerConfig::for_reconciler("WorkloadReconciler", "CONTROL", "control.workload");
        assert_eq!(config.durable_name, "WorkloadReconcilerConsumer");
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
    }

    #[test]
    fn subject_filters() {
        assert!(subject_matches("control.workload", "control.workload"));
        assert!(subject_matches("control.*", "control.gateway"));
        assert!(subject_matches("control.>", "control.gateway.v1"));
        assert!(!subject_matches("control.*", "control.gateway.v1"));
        assert!(!subject_matches("control.workload", "control.gateway"));
        assert!(!subject_matches("control.>", "control"));
    }
}
