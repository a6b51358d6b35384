//! recepta-events
//!
//! At-least-once event publication. [`EventPublisher`] is the port; the
//! shipped implementation is an in-process broadcast bus ([`MemoryBus`])
//! that run aggregation and tests subscribe to. [`DurablePublisher`] wraps
//! any publisher with bounded retries and spills undeliverable envelopes
//! into the store's dead-letter collection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

use recepta_core::clock::Clock;
use recepta_core::error::ReceptaError;
use recepta_core::event::Event;
use recepta_core::types::Timestamp;
use recepta_store::{Collection, Store};

// ── Port ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Deliver one event. At-least-once: callers may retry, consumers must
    /// dedup on the event key.
    async fn publish(&self, event: Event) -> Result<(), ReceptaError>;
}

// ── MemoryBus ────────────────────────────────────────────────────────────────

/// In-process broadcast bus. Subscribers receive every event published after
/// they subscribed; a lagging subscriber loses oldest events first, which is
/// acceptable for at-least-once consumers that reconcile from the store.
pub struct MemoryBus {
    tx: broadcast::Sender<Event>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl EventPublisher for MemoryBus {
    async fn publish(&self, event: Event) -> Result<(), ReceptaError> {
        // send() only fails when there is no live receiver; with nobody
        // listening the event is simply dropped, matching a fire-and-forget
        // topic with zero consumers.
        let _ = self.tx.send(event);
        Ok(())
    }
}

// ── Dead letters ─────────────────────────────────────────────────────────────

/// Envelope written to the `dlq` collection when delivery keeps failing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: uuid::Uuid,
    pub topic: String,
    pub key: String,
    /// The event, JSON-encoded the way it would have been published.
    pub payload: String,
    pub error: String,
    pub attempts: u32,
    pub created_at: Timestamp,
}

// ── DurablePublisher ─────────────────────────────────────────────────────────

/// Retrying wrapper: `attempts` tries with doubling delay, then a DLQ row.
/// The DLQ write itself failing is the one place we surface
/// [`ReceptaError::Publish`] upward.
pub struct DurablePublisher {
    inner: Arc<dyn EventPublisher>,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    attempts: u32,
    base_delay: Duration,
}

impl DurablePublisher {
    pub fn new(inner: Arc<dyn EventPublisher>, store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            store,
            clock,
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }

    #[cfg(test)]
    fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }

    async fn spill(&self, event: &Event, error: &ReceptaError) -> Result<(), ReceptaError> {
        let letter = DeadLetter {
            id: uuid::Uuid::new_v4(),
            topic: event.topic().to_string(),
            key: event.key(),
            payload: serde_json::to_string(event)
                .map_err(|e| ReceptaError::Serialization(e.to_string()))?,
            error: error.to_string(),
            attempts: self.attempts,
            created_at: self.clock.now(),
        };
        let dlq_topic = format!("{}-dlq", letter.topic);
        self.store.upsert(
            Collection::Dlq,
            &dlq_topic,
            &letter.id.to_string(),
            &letter,
            None,
            letter.created_at,
        )?;
        warn!(topic = %dlq_topic, key = %letter.key, "event dead-lettered");
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for DurablePublisher {
    async fn publish(&self, event: Event) -> Result<(), ReceptaError> {
        let mut delay = self.base_delay;
        let mut last_err = None;
        for attempt in 1..=self.attempts {
            match self.inner.publish(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, topic = event.topic(), "publish failed");
                    last_err = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        let err = last_err.unwrap_or_else(|| ReceptaError::Publish("unknown".into()));
        self.spill(&event, &err).await?;
        Err(ReceptaError::Publish(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recepta_core::clock::SystemClock;
    use recepta_core::types::RunId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn batch_started() -> Event {
        let now = chrono::Utc::now();
        Event::BatchStarted {
            run_id: RunId::allocate(now),
            jobs_enqueued: 1,
            at: now,
        }
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = MemoryBus::default();
        let mut rx = bus.subscribe();
        bus.publish(batch_started()).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert!(matches!(got, Event::BatchStarted { .. }));
    }

    #[tokio::test]
    async fn bus_without_subscribers_drops_silently() {
        let bus = MemoryBus::default();
        bus.publish(batch_started()).await.unwrap();
    }

    struct Flaky {
        failures: AtomicU32,
    }

    #[async_trait]
    impl EventPublisher for Flaky {
        async fn publish(&self, _event: Event) -> Result<(), ReceptaError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                if f > 0 { Some(f - 1) } else { None }
            }).is_ok()
            {
                return Err(ReceptaError::Publish("broker down".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn durable_publisher_retries_through_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let flaky = Arc::new(Flaky {
            failures: AtomicU32::new(2),
        });
        let publisher = DurablePublisher::new(flaky, store.clone(), Arc::new(SystemClock))
            .with_base_delay(Duration::from_millis(1));
        publisher.publish(batch_started()).await.unwrap();
        assert_eq!(store.count(Collection::Dlq), 0);
    }

    #[tokio::test]
    async fn durable_publisher_spills_to_dlq_on_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let flaky = Arc::new(Flaky {
            failures: AtomicU32::new(100),
        });
        let publisher = DurablePublisher::new(flaky, store.clone(), Arc::new(SystemClock))
            .with_base_delay(Duration::from_millis(1));
        let err = publisher.publish(batch_started()).await.unwrap_err();
        assert!(matches!(err, ReceptaError::Publish(_)));
        assert_eq!(store.count(Collection::Dlq), 1);
    }
}
