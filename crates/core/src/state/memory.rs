//! In-memory implementation of StateBackend for testing

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::{BackendError, StateBackend};
use crate::routing::StorageKey;

/// In-memory implementation of StateBackend
///
/// Keeps the latest value per key plus the full write log, so tests can
/// assert both the resulting state and the exact sequence of writes.
///
/// # Example
///
/// ```
/// use staterelay_core::state::InMemoryStateBackend;
///
/// let backend = InMemoryStateBackend::new();
/// assert_eq!(backend.write_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryStateBackend {
    values: RwLock<HashMap<String, Vec<u8>>>,
    writes: RwLock<Vec<(String, Vec<u8>)>>,
}

impl InMemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value stored under `key`
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.read().get(key).cloned()
    }

    /// Every write in the order it was applied
    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.writes.read().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

#[async_trait]
impl StateBackend for InMemoryStateBackend {
    async fn set(&self, key: &StorageKey, body: &[u8]) -> Result<(), BackendError> {
        let mut values = self.values.write();
        let mut writes = self.writes.write();
        values.insert(key.to_string(), body.to_vec());
        writes.push((key.to_string(), body.to_vec()));
        Ok(())
    }
}
