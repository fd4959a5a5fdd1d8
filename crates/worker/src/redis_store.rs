// Redis state backend
// Decision: ConnectionManager handles reconnects; each write uses a cheap clone of it
// Decision: Values are stored without expiry, overwriting the previous state

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use tracing::info;

use staterelay_core::{BackendError, StateBackend, StorageKey};

/// State backend writing to a Redis server
#[derive(Clone)]
pub struct RedisStateBackend {
    connection: ConnectionManager,
}

impl RedisStateBackend {
    /// Open a managed connection to `url`.
    ///
    /// Fails when the URL cannot be parsed or the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!("Connected to Redis");

        Ok(Self { connection })
    }
}

#[async_trait]
impl StateBackend for RedisStateBackend {
    async fn set(&self, key: &StorageKey, body: &[u8]) -> Result<(), BackendError> {
        let mut connection = self.connection.clone();
        connection
            .set::<_, _, ()>(key.as_str(), body)
            .await
            .map_err(classify)
    }
}

/// Separate transport failures from command failures
fn classify(error: RedisError) -> BackendError {
    if error.is_io_error()
        || error.is_connection_refusal()
        || error.is_connection_dropped()
        || error.is_timeout()
    {
        BackendError::Connection(Box::new(error))
    } else {
        BackendError::Write(Box::new(error))
    }
}
