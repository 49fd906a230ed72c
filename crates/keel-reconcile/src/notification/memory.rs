//! In-memory broker implementation for testing.
//!
//! This module provides [`InMemoryBroker`], an in-process stand-in for a
//! streaming broker with durable pull consumers.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Single-process only**: Streams are not visible across process boundaries
//! - **Unbounded**: Streams retain every published message

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use ulid::Ulid;

use super::{
    subject_matches, Broker, ConsumerConfig, Delivery, Notification, NotificationChannel,
};
use crate::error::{Error, Result};

/// Upper bound on a single wait inside `pull`.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Stand-in for "never" when a delay does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Returns `now + delay`, saturating to a far-future instant on overflow.
fn after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// A message stored in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Message ID.
    pub message_id: String,
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
}

/// A recorded negative acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakRecord {
    /// Message that was nak'd.
    pub message_id: String,
    /// Requested redelivery delay.
    pub delay: Duration,
    /// Delivery attempt that was nak'd.
    pub delivery_count: u32,
}

#[derive(Debug)]
struct Pending {
    message: StoredMessage,
    deliveries: u32,
    visible_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    deliveries: u32,
    deadline: Instant,
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    pending: VecDeque<Pending>,
    in_flight: HashMap<String, InFlight>,
    acked: Vec<String>,
    naks: Vec<NakRecord>,
}

impl ConsumerState {
    fn new(config: ConsumerConfig, backlog: &[StoredMessage]) -> Self {
        let now = Instant::now();
        let pending = backlog
            .iter()
            .filter(|m| subject_matches(&config.filter_subject, &m.subject))
            .map(|m| Pending {
                message: m.clone(),
                deliveries: 0,
                visible_at: now,
            })
            .collect();
        Self {
            config,
            pending,
            in_flight: HashMap::new(),
            acked: Vec::new(),
            naks: Vec::new(),
        }
    }

    /// Moves expired in-flight deliveries back to pending.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                self.pending.push_back(Pending {
                    message: flight.message,
                    deliveries: flight.deliveries,
                    visible_at: now,
                });
            }
        }
    }

    fn take_visible(&mut self, now: Instant) -> Option<Delivery> {
        let index = self.pending.iter().position(|p| p.visible_at <= now)?;
        let pending = self.pending.remove(index)?;
        let deliveries = pending.deliveries + 1;
        let delivery = Delivery {
            message_id: pending.message.message_id.clone(),
            subject: pending.message.subject.clone(),
            payload: pending.message.payload.clone(),
            delivery_count: deliveries,
        };
        self.in_flight.insert(
            pending.message.message_id.clone(),
            InFlight {
                message: pending.message,
                deliveries,
                deadline: after(now, self.config.ack_wait),
            },
        );
        Some(delivery)
    }

    fn next_wake(&self) -> Option<Instant> {
        self.pending
            .iter()
            .map(|p| p.visible_at)
            .chain(self.in_flight.values().map(|f| f.deadline))
            .min()
    }
}

#[derive(Debug)]
struct StreamState {
    subjects: Vec<String>,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<BrokerState>,
    notify: Notify,
}

/// Converts a lock poison error to a broker error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::broker("broker lock poisoned")
}

/// In-memory broker with streams and durable pull consumers.
///
/// Cloning yields another handle to the same broker.
///
/// ## Example
///
/// ```rust
/// use keel_reconcile::notification::memory::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// broker.create_stream("CONTROL", ["control.>"]).expect("stream");
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a stream capturing `subjects`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn create_stream<I, S>(&self, name: &str, subjects: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.inner.state.write().map_err(poison_err)?;
        state
            .streams
            .entry(name.to_string())
            .or_insert_with(|| StreamState {
                subjects: subjects.into_iter().map(Into::into).collect(),
                messages: Vec::new(),
                consumers: HashMap::new(),
            });
        drop(state);
        Ok(())
    }

    /// Publishes a raw payload on `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`] if no stream captures the subject.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<String> {
        let message = StoredMessage {
            message_id: Ulid::new().to_string(),
            subject: subject.to_string(),
            payload: payload.into(),
        };

        let mut state = self.inner.state.write().map_err(poison_err)?;
        let stream = state
            .streams
            .values_mut()
            .find(|s| s.subjects.iter().any(|f| subject_matches(f, subject)))
            .ok_or_else(|| Error::StreamNotFound {
                stream: format!("<capturing {subject}>"),
            })?;

        let now = Instant::now();
        for consumer in stream.consumers.values_mut() {
            if subject_matches(&consumer.config.filter_subject, subject) {
                consumer.pending.push_back(Pending {
                    message: message.clone(),
                    deliveries: 0,
                    visible_at: now,
                });
            }
        }
        stream.messages.push(message.clone());
        drop(state);

        self.inner.notify.notify_waiters();
        Ok(message.message_id)
    }

    /// Publishes an encoded notification on `subject`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or no stream captures the subject.
    pub fn publish_notification(&self, subject: &str, notification: &Notification) -> Result<String> {
        self.publish(subject, notification.encode()?)
    }

    /// Returns every message published to a stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`] if the stream does not exist.
    pub fn messages(&self, stream: &str) -> Result<Vec<StoredMessage>> {
        let state = self.inner.state.read().map_err(poison_err)?;
        state
            .streams
            .get(stream)
            .map(|s| s.messages.clone())
            .ok_or_else(|| Error::StreamNotFound {
                stream: stream.to_string(),
            })
    }

    /// Returns IDs acked on a durable consumer, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn acked(&self, durable_name: &str) -> Result<Vec<String>> {
        self.with_consumer(durable_name, |c| c.acked.clone())
    }

    /// Returns naks recorded on a durable consumer, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn naks(&self, durable_name: &str) -> Result<Vec<NakRecord>> {
        self.with_consumer(durable_name, |c| c.naks.clone())
    }

    /// Returns the number of messages waiting (including delayed ones).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending_count(&self, durable_name: &str) -> Result<usize> {
        self.with_consumer(durable_name, |c| c.pending.len())
    }

    /// Returns the number of delivered but unacknowledged messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn in_flight_count(&self, durable_name: &str) -> Result<usize> {
        self.with_consumer(durable_name, |c| c.in_flight.len())
    }

    fn with_consumer<R>(&self, durable_name: &str, f: impl Fn(&ConsumerState) -> R) -> Result<R>
    where
        R: Default,
    {
        let state = self.inner.state.read().map_err(poison_err)?;
        Ok(state
            .streams
            .values()
            .find_map(|s| s.consumers.get(durable_name))
            .map(f)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn bind_consumer(&self, config: ConsumerConfig) -> Result<Arc<dyn NotificationChannel>> {
        let mut state = self.inner.state.write().map_err(poison_err)?;
        let stream = state
            .streams
            .get_mut(&config.stream)
            .ok_or_else(|| Error::StreamNotFound {
                stream: config.stream.clone(),
            })?;

        if !stream.consumers.contains_key(&config.durable_name) {
            let consumer = ConsumerState::new(config.clone(), &stream.messages);
            stream
                .consumers
                .insert(config.durable_name.clone(), consumer);
        }
        drop(state);

        tracing::debug!(
            consumer = %config.durable_name,
            stream = %config.stream,
            filter = %config.filter_subject,
            "bound durable consumer"
        );

        let channel: Arc<dyn NotificationChannel> = Arc::new(InMemoryChannel {
            inner: Arc::clone(&self.inner),
            stream: config.stream,
            durable_name: config.durable_name,
            closed: AtomicBool::new(false),
        });
        Ok(channel)
    }
}

/// One subscription handle on a durable consumer.
#[derive(Debug)]
pub struct InMemoryChannel {
    inner: Arc<Inner>,
    stream: String,
    durable_name: String,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn with_consumer_mut<R>(&self, f: impl FnOnce(&mut ConsumerState) -> Result<R>) -> Result<R> {
        let mut state = self.inner.state.write().map_err(poison_err)?;
        let consumer = state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.durable_name))
            .ok_or_else(|| Error::broker(format!("consumer {} vanished", self.durable_name)))?;
        f(consumer)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::broker(format!(
                "subscription {} is closed",
                self.durable_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for InMemoryChannel {
    async fn pull(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = after(Instant::now(), timeout);
        loop {
            self.ensure_open()?;
            let now = Instant::now();
            let (delivery, next_wake) = self.with_consumer_mut(|consumer| {
                consumer.reclaim_expired(now);
                Ok((consumer.take_visible(now), consumer.next_wake()))
            })?;

            if delivery.is_some() {
                return Ok(delivery);
            }
            if now >= deadline {
                return Ok(None);
            }

            let wake = next_wake.map_or(deadline, |w| w.min(deadline));
            let wait = wake.saturating_duration_since(now).min(POLL_SLICE);
            let _ = tokio::time::timeout(wait, self.inner.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.with_consumer_mut(|consumer| {
            if consumer.in_flight.remove(&delivery.message_id).is_none() {
                return Err(Error::broker(format!(
                    "message {} is not in flight",
                    delivery.message_id
                )));
            }
            consumer.acked.push(delivery.message_id.clone());
            Ok(())
        })
    }

    async fn nak_with_delay(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.with_consumer_mut(|consumer| {
            let flight = consumer
                .in_flight
                .remove(&delivery.message_id)
                .ok_or_else(|| {
                    Error::broker(format!("message {} is not in flight", delivery.message_id))
                })?;
            consumer.naks.push(NakRecord {
                message_id: delivery.message_id.clone(),
                delay,
                delivery_count: flight.deliveries,
            });
            consumer.pending.push_back(Pending {
                message: flight.message,
                deliveries: flight.deliveries,
                visible_at: after(Instant::now(), delay),
            });
            Ok(())
        })?;
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        tracing::debug!(consumer = %self.durable_name, "unsubscribed");
        Ok(())
    }

    fn consumer_name(&self) -> &str {
        &self.durable_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "CONTROL";
    const SUBJECT: &str = "control.workload";

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_stream(STREAM, ["control.>"]).expect("stream");
        broker
    }

    fn config(ack_wait: Duration) -> ConsumerConfig {
        ConsumerConfig::for_reconciler("Workload", STREAM, SUBJECT).with_ack_wait(ack_wait)
    }

    #[tokio::test]
    async fn binding_to_missing_stream_fails() {
        let broker = InMemoryBroker::new();
        let err = broker
            .bind_consumer(config(Duration::from_secs(30)))
            .await
            .err()
            .expect("no stream");
        assert!(matches!(err, Error::StreamNotFound { .. }));
    }

    #[tokio::test]
    async fn pull_times_out_when_empty() {
        let broker = broker();
        let channel = broker.bind_consumer(config(Duration::from_secs(30))).await.expect("bind");
        let pulled = channel.pull(Duration::from_millis(20)).await.expect("pull");
        assert!(pulled.is_none());
    }

    #[tokio::test]
    async fn backlog_is_delivered_to_new_consumer() {
        let broker = broker();
        let id = broker.publish(SUBJECT, "hello").expect("publish");
        broker.publish("control.gateway", "other").expect("publish");

        let channel = broker.bind_consumer(config(Duration::from_secs(30))).await.expect("bind");
        let delivery = channel
            .pull(Duration::from_millis(100))
            .await
            .expect("pull")
            .expect("message");
        assert_eq!(delivery.message_id, id);
        assert_eq!(delivery.delivery_count, 1);
        assert_eq!(&delivery.payload[..], b"hello");

        channel.ack(&delivery).await.expect("ack");
        assert_eq!(broker.acked("WorkloadConsumer").expect("acked"), vec![id]);
        assert!(channel.pull(Duration::from_millis(20)).await.expect("pull").is_none());
    }

    #[tokio::test]
    async fn pull_wakes_on_publish() {
        let broker = broker();
        let channel = broker.bind_consumer(config(Duration::from_secs(30))).await.expect("bind");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(SUBJECT, "late").expect("publish");
        });

        let delivery = channel.pull(Duration::from_secs(2)).await.expect("pull");
        assert!(delivery.is_some());
    }

    #[tokio::test]
    async fn nak_delays_redelivery() {
        let broker = broker();
        let channel = broker.bind_consumer(config(Duration::from_secs(30))).await.expect("bind");
        broker.publish(SUBJECT, "x").expect("publish");

        let first = channel.pull(Duration::from_millis(100)).await.expect("pull").expect("msg");
        channel
            .nak_with_delay(&first, Duration::from_millis(80))
            .await
            .expect("nak");

        assert!(channel.pull(Duration::from_millis(10)).await.expect("pull").is_none());
        let second = channel.pull(Duration::from_secs(1)).await.expect("pull").expect("msg");
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.delivery_count, 2);

        let naks = broker.naks("WorkloadConsumer").expect("naks");
        assert_eq!(naks.len(), 1);
        assert_eq!(naks[0].delay, Duration::from_millis(80));
    }

    #[tokio::test]
    async fn nak_with_unbounded_delay_parks_message() {
        let broker = broker();
        let channel = broker.bind_consumer(config(Duration::from_secs(30))).await.expect("bind");
        broker.publish(SUBJECT, "x").expect("publish");

        let first = channel.pull(Duration::from_millis(100)).await.expect("pull").expect("msg");
        channel
            .nak_with_delay(&first, Duration::MAX)
            .await
            .expect("nak");

        assert!(channel.pull(Duration::from_millis(20)).await.expect("pull").is_none());
        assert_eq!(broker.pending_count("WorkloadConsumer").expect("pending"), 1);
        assert_eq!(broker.in_flight_count("WorkloadConsumer").expect("in flight"), 0);
    }

    #[tokio::test]
    async fn pull_tracks_in_flight_until_ack() {
        let broker = broker();
        let channel = broker.bind_consumer(config(Duration::from_secs(30))).await.expect("bind");
        broker.publish(SUBJECT, "x").expect("publish");
        assert_eq!(broker.pending_count("WorkloadConsumer").expect("pending"), 1);

        let delivery = channel.pull(Duration::from_millis(100)).await.expect("pull").expect("msg");
        assert_eq!(broker.pending_count("WorkloadConsumer").expect("pending"), 0);
        assert_eq!(broker.in_flight_count("WorkloadConsumer").expect("in flight"), 1);

        channel.ack(&delivery).await.expect("ack");
        assert_eq!(broker.in_flight_count("WorkloadConsumer").expect("in flight"), 0);
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered_after_ack_wait() {
        let broker = broker();
        let channel = broker.bind_consumer(config(Duration::from_millis(30))).await.expect("bind");
        broker.publish(SUBJECT, "x").expect("publish");

        let first = channel.pull(Duration::from_millis(100)).await.expect("pull").expect("msg");
        let again = channel.pull(Duration::from_secs(1)).await.expect("pull").expect("msg");
        assert_eq!(again.message_id, first.message_id);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn same_durable_name_shares_one_queue() {
        let broker = broker();
        let a = broker.bind_consumer(config(Duration::from_secs(30))).await.expect("bind");
        let b = broker.bind_consumer(config(Duration::from_secs(30))).await.expect("bind");
        broker.publish(SUBJECT, "only-once").expect("publish");

        let got_a = a.pull(Duration::from_millis(50)).await.expect("pull");
        let got_b = b.pull(Duration::from_millis(50)).await.expect("pull");
        assert_eq!(usize::from(got_a.is_some()) + usize::from(got_b.is_some()), 1);
    }

    #[tokio::test]
    async fn closed_subscription_rejects_pull() {
        let broker = broker();
        let channel = broker.bind_consumer(config(Duration::from_secs(30))).await.expect("bind");
        channel.unsubscribe().await.expect("unsubscribe");
        assert!(channel.pull(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn publish_without_stream_fails() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.publish("nowhere", "x"),
            Err(Error::StreamNotFound { .. })
        ));
    }
}
