//! Broker consumer abstraction
//!
//! The relay never talks to the broker directly. A [`Consumer`] hands out
//! one [`Subscription`] per worker: a stream of deliveries plus an
//! [`Intake`] used to stop that stream during shutdown.
//!
//! This module provides:
//! - [`Consumer`] and [`Intake`] traits implemented by broker bindings
//! - [`InMemoryConsumer`] for testing

mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::delivery::Delivery;
use crate::state::BoxError;

pub use memory::InMemoryConsumer;

/// Deliveries for one worker, in receipt order
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Error type for consumer operations
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// Could not establish the subscription
    #[error("subscribe failed for {consumer_tag}: {source}")]
    Subscribe {
        consumer_tag: String,
        #[source]
        source: BoxError,
    },

    /// Could not stop delivery intake
    #[error("cancel failed for {consumer_tag}: {source}")]
    Cancel {
        consumer_tag: String,
        #[source]
        source: BoxError,
    },

    /// Could not release broker resources after drain
    #[error("close failed for {consumer_tag}: {source}")]
    Close {
        consumer_tag: String,
        #[source]
        source: BoxError,
    },
}

/// Controls delivery intake for one subscription
#[async_trait]
pub trait Intake: Send {
    /// Stop handing out new deliveries.
    ///
    /// Once cancelled, the broker closes the subscription's stream after
    /// yielding whatever it had already handed over.
    async fn cancel(&mut self) -> Result<(), ConsumerError>;

    /// Release broker resources once the stream has been drained.
    async fn close(&mut self) -> Result<(), ConsumerError> {
        Ok(())
    }
}

/// One worker's binding to the broker
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
    pub intake: Box<dyn Intake>,
}

/// Source of per-worker delivery streams
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Open a new subscription identified by `consumer_tag`
    async fn subscribe(&self, consumer_tag: &str) -> Result<Subscription, ConsumerError>;
}
