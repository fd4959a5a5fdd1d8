pub mod amqp;
pub mod config;
pub mod redis_store;
pub mod status;

// Re-export main types
pub use amqp::{AmqpConsumer, AmqpSettings};
pub use config::Cli;
pub use redis_store::RedisStateBackend;
pub use status::{router, StatusServer, StatusState};
