//! Delivery worker
//!
//! Each worker owns one subscription and drives its deliveries, strictly in
//! receipt order, through parse -> save -> ack. A failed save is logged and
//! the delivery is still acknowledged: the broker never redelivers because
//! of a store failure.

use std::time::Instant;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::consumer::{ConsumerError, DeliveryStream, Intake, Subscription};
use crate::delivery::Delivery;
use crate::metrics::RelayMetrics;
use crate::state::StateStore;

/// Outcome of a worker's consumption loop, reported once its stream ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub index: usize,
    /// Deliveries received and acknowledged (or attempted)
    pub processed: u64,
    /// Deliveries whose state could not be saved
    pub failed: u64,
}

/// Worker shutdown errors
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// Broker-side cancel or close failed
    #[error("consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    /// The worker stopped without reporting completion
    #[error("worker {0} exited without signalling completion")]
    WorkerLost(usize),
}

/// Consumption loop for a single subscription
#[derive(Clone)]
pub struct Worker {
    index: usize,
    store: StateStore,
    metrics: RelayMetrics,
}

impl Worker {
    pub fn new(index: usize, store: StateStore, metrics: RelayMetrics) -> Self {
        Self {
            index,
            store,
            metrics,
        }
    }

    /// Consume `deliveries` until the broker closes the stream, then signal
    /// `done` exactly once.
    #[instrument(skip_all, fields(worker = self.index))]
    pub async fn handle(self, mut deliveries: DeliveryStream, done: oneshot::Sender<WorkerSummary>) {
        let mut summary = WorkerSummary {
            index: self.index,
            ..Default::default()
        };

        while let Some(delivery) = deliveries.next().await {
            if !self.process(delivery).await {
                summary.failed += 1;
            }
            summary.processed += 1;
        }

        debug!("Deliveries channel closed");

        if done.send(summary).is_err() {
            warn!("Completion signal dropped, nobody is waiting for this worker");
        }
    }

    /// Save and acknowledge one delivery.
    ///
    /// Returns whether the state was saved. The delivery is acknowledged
    /// either way.
    pub async fn process(&self, delivery: Delivery) -> bool {
        self.metrics.record_processed();
        let start = Instant::now();

        debug!(
            routing_key = %delivery.routing_key,
            payload_bytes = delivery.body.len(),
            delivery_tag = delivery.delivery_tag,
            "Received delivery"
        );

        let saved = match self.store.save(&delivery.body, &delivery.routing_key).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to process payload");
                false
            }
        };

        let delivery_tag = delivery.delivery_tag;
        if let Err(e) = delivery.ack().await {
            error!(delivery_tag, error = %e, "Failed to acknowledge delivery");
        }

        self.metrics.record_processing_time(start.elapsed());
        saved
    }

    /// Run this worker on `subscription` in a background task
    pub fn spawn(self, subscription: Subscription) -> WorkerHandle {
        let Subscription {
            consumer_tag,
            deliveries,
            intake,
        } = subscription;

        let index = self.index;
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(self.handle(deliveries, done_tx));

        info!(worker = index, consumer_tag = %consumer_tag, "Worker started");

        WorkerHandle {
            index,
            consumer_tag,
            intake,
            done: done_rx,
            task,
        }
    }
}

/// A running worker and its broker binding
pub struct WorkerHandle {
    index: usize,
    consumer_tag: String,
    intake: Box<dyn Intake>,
    done: oneshot::Receiver<WorkerSummary>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Stop intake and wait for in-flight deliveries to be acknowledged.
    ///
    /// Consumes the handle: a worker is shut down at most once. If the
    /// broker refuses the cancel, the error is returned without waiting.
    #[instrument(skip(self), fields(worker = self.index, consumer_tag = %self.consumer_tag))]
    pub async fn shutdown(mut self) -> Result<WorkerSummary, ShutdownError> {
        self.intake.cancel().await?;

        let summary = (&mut self.done)
            .await
            .map_err(|_| ShutdownError::WorkerLost(self.index))?;

        if let Err(e) = self.task.await {
            warn!(error = %e, "Worker task did not exit cleanly");
        }

        self.intake.close().await?;

        debug!(
            processed = summary.processed,
            failed = summary.failed,
            "Worker drained"
        );
        Ok(summary)
    }
}
