//! In-memory implementation of Consumer for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Consumer, ConsumerError, Intake, Subscription};
use crate::delivery::{AckError, Acknowledge, Delivery};

#[derive(Default)]
struct Inner {
    /// Open senders by subscription index; `None` once intake is cancelled
    senders: Mutex<Vec<Option<mpsc::UnboundedSender<Delivery>>>>,
    consumer_tags: Mutex<Vec<String>>,
    /// Ack count per delivery tag
    acks: Mutex<HashMap<u64, usize>>,
    next_tag: AtomicU64,
    next_target: AtomicUsize,
    subscribe_limit: Option<usize>,
    failing_cancels: Vec<usize>,
    closed: Mutex<Vec<String>>,
}

/// In-memory broker
///
/// Each subscription gets its own unbounded queue. Deliveries are published
/// either to a specific subscription or round-robin across the open ones,
/// and every acknowledgment is recorded by delivery tag.
///
/// # Example
///
/// ```
/// use staterelay_core::consumer::InMemoryConsumer;
///
/// let consumer = InMemoryConsumer::new();
/// assert_eq!(consumer.subscription_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryConsumer {
    inner: Arc<Inner>,
}

impl InMemoryConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subscribe call after the first `limit` succeed
    pub fn with_subscribe_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribe_limit: Some(limit),
                ..Default::default()
            }),
        }
    }

    /// Fail `cancel` for the subscriptions at the given indices
    pub fn with_failing_cancels(indices: Vec<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                failing_cancels: indices,
                ..Default::default()
            }),
        }
    }

    /// Publish to the subscription at `index`.
    ///
    /// Returns the delivery tag, or `None` if that subscription is not open.
    pub fn publish_to(&self, index: usize, routing_key: &str, body: &[u8]) -> Option<u64> {
        let senders = self.inner.senders.lock();
        let sender = senders.get(index)?.as_ref()?;

        let delivery_tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let acker = MemoryAcker {
            inner: Arc::clone(&self.inner),
        };
        sender
            .send(Delivery::new(routing_key, body, delivery_tag, Box::new(acker)))
            .ok()?;
        Some(delivery_tag)
    }

    /// Publish round-robin across the open subscriptions
    pub fn publish(&self, routing_key: &str, body: &[u8]) -> Option<u64> {
        let count = self.subscription_count();
        for _ in 0..count {
            let index = self.inner.next_target.fetch_add(1, Ordering::SeqCst) % count;
            if let Some(tag) = self.publish_to(index, routing_key, body) {
                return Some(tag);
            }
        }
        None
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.senders.lock().len()
    }

    /// Consumer tags in subscription order
    pub fn consumer_tags(&self) -> Vec<String> {
        self.inner.consumer_tags.lock().clone()
    }

    /// How many times the delivery was acknowledged
    pub fn ack_count(&self, delivery_tag: u64) -> usize {
        self.inner
            .acks
            .lock()
            .get(&delivery_tag)
            .copied()
            .unwrap_or(0)
    }

    /// Total acknowledgments across all deliveries
    pub fn total_acks(&self) -> usize {
        self.inner.acks.lock().values().sum()
    }

    /// Whether intake is still open for the subscription at `index`
    pub fn is_open(&self, index: usize) -> bool {
        matches!(self.inner.senders.lock().get(index), Some(Some(_)))
    }

    /// Consumer tags whose subscriptions were closed, in close order
    pub fn closed(&self) -> Vec<String> {
        self.inner.closed.lock().clone()
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn subscribe(&self, consumer_tag: &str) -> Result<Subscription, ConsumerError> {
        let mut senders = self.inner.senders.lock();

        if let Some(limit) = self.inner.subscribe_limit {
            if senders.len() >= limit {
                return Err(ConsumerError::Subscribe {
                    consumer_tag: consumer_tag.to_string(),
                    source: "subscription limit reached".into(),
                });
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let index = senders.len();
        senders.push(Some(tx));
        self.inner.consumer_tags.lock().push(consumer_tag.to_string());

        Ok(Subscription {
            consumer_tag: consumer_tag.to_string(),
            deliveries: UnboundedReceiverStream::new(rx).boxed(),
            intake: Box::new(MemoryIntake {
                inner: Arc::clone(&self.inner),
                index,
                consumer_tag: consumer_tag.to_string(),
            }),
        })
    }
}

struct MemoryIntake {
    inner: Arc<Inner>,
    index: usize,
    consumer_tag: String,
}

#[async_trait]
impl Intake for MemoryIntake {
    async fn cancel(&mut self) -> Result<(), ConsumerError> {
        if self.inner.failing_cancels.contains(&self.index) {
            return Err(ConsumerError::Cancel {
                consumer_tag: self.consumer_tag.clone(),
                source: "channel closed by broker".into(),
            });
        }

        if let Some(slot) = self.inner.senders.lock().get_mut(self.index) {
            slot.take();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConsumerError> {
        self.inner.closed.lock().push(self.consumer_tag.clone());
        Ok(())
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AckError> {
        *self.inner.acks.lock().entry(delivery_tag).or_insert(0) += 1;
        Ok(())
    }
}
