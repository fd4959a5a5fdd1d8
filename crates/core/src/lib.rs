// State Relay Core
//
// Consumes device state events from a broker, extracts the identity encoded
// in each routing key and caches the payload as that identity's last known
// state.
//
// Key design decisions:
// - Broker and store sit behind traits (Consumer, StateBackend) so the
//   parse -> save -> ack cycle can be tested without either
// - One worker per subscription; deliveries within a worker are processed in
//   receipt order, with no ordering across workers
// - Every delivery is acknowledged exactly once, whatever the save outcome
// - Metrics and the state store are built once and injected into each worker

pub mod consumer;
pub mod delivery;
pub mod lifecycle;
pub mod metrics;
pub mod routing;
pub mod state;
pub mod telemetry;
pub mod worker;

// Re-exports for convenience
pub use consumer::{Consumer, ConsumerError, DeliveryStream, InMemoryConsumer, Intake, Subscription};
pub use delivery::{AckError, Acknowledge, Delivery};
pub use lifecycle::{
    shutdown_signal, Relay, RelayConfig, RelayStatus, ShutdownReport, StartupError,
};
pub use metrics::RelayMetrics;
pub use routing::{Identity, RoutingKeyParser, StorageKey, STATE_BINDING_KEY};
pub use state::{
    BackendError, BoxError, InMemoryStateBackend, SaveError, StateBackend, StateStore,
};
pub use worker::{ShutdownError, Worker, WorkerHandle, WorkerSummary};
