//! StateStore and the StateBackend trait

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::routing::{RoutingKeyParser, StorageKey};

/// Boxed underlying cause carried by backend errors
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error type for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Could not obtain a connection to the store
    #[error("connection error: {0}")]
    Connection(#[source] BoxError),

    /// The store rejected or failed the write
    #[error("write error: {0}")]
    Write(#[source] BoxError),
}

/// Error returned by [`StateStore::save`]
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// Routing key does not carry an identity; the store was not touched
    #[error("bad routing key - {0}")]
    BadRoutingKey(String),

    /// Writing to the store failed
    #[error("failed to store state under {key}: {source}")]
    Store {
        key: StorageKey,
        #[source]
        source: BackendError,
    },
}

/// Key-value store holding the last known state per key
///
/// Implementations must be safe to share between all workers. Each call
/// is a single unconditional overwrite with no expiry.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Overwrite `key` with `body`
    async fn set(&self, key: &StorageKey, body: &[u8]) -> Result<(), BackendError>;
}

/// Persists message payloads as the last known state of the identity
/// encoded in their routing key.
#[derive(Clone)]
pub struct StateStore {
    parser: RoutingKeyParser,
    backend: Arc<dyn StateBackend>,
}

impl StateStore {
    pub fn new(parser: RoutingKeyParser, backend: Arc<dyn StateBackend>) -> Self {
        Self { parser, backend }
    }

    /// Cache `body` under the key derived from `routing_key`.
    ///
    /// Returns the key written on success. A routing key that does not match
    /// is rejected before the backend is called.
    pub async fn save(&self, body: &[u8], routing_key: &str) -> Result<StorageKey, SaveError> {
        let identity = self
            .parser
            .parse(routing_key)
            .ok_or_else(|| SaveError::BadRoutingKey(routing_key.to_string()))?;

        let key = identity.storage_key();

        match self.backend.set(&key, body).await {
            Ok(()) => {
                debug!(key = %key, bytes = body.len(), "Stored state");
                Ok(key)
            }
            Err(source) => Err(SaveError::Store { key, source }),
        }
    }
}
