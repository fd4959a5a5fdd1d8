//! State persistence
//!
//! This module provides:
//! - [`StateStore`] which turns a routing key and payload into a single store write
//! - [`StateBackend`] trait for the key-value store
//! - [`InMemoryStateBackend`] for testing

mod memory;
mod store;

pub use memory::InMemoryStateBackend;
pub use store::{BackendError, BoxError, SaveError, StateBackend, StateStore};
