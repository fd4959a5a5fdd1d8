//! Broker deliveries
//!
//! A [`Delivery`] is owned by exactly one worker from receipt until it is
//! acknowledged. `ack` consumes the delivery, so it can be acknowledged at
//! most once.

use std::fmt;

use async_trait::async_trait;

use crate::state::BoxError;

/// Error returned when the broker rejects or cannot receive an acknowledgment
#[derive(Debug, thiserror::Error)]
#[error("failed to acknowledge delivery {delivery_tag}: {source}")]
pub struct AckError {
    pub delivery_tag: u64,
    #[source]
    pub source: BoxError,
}

/// Broker-side acknowledgment of a single delivery
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Acknowledge the delivery only (no `multiple`), without requeue.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AckError>;
}

/// One message received from the broker
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
        delivery_tag: u64,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            delivery_tag,
            acker,
        }
    }

    /// Acknowledge the delivery, ending this worker's ownership of it.
    pub async fn ack(self) -> Result<(), AckError> {
        self.acker.ack(self.delivery_tag).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}
