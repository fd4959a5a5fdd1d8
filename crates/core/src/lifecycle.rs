//! Relay lifecycle
//!
//! `Starting -> Running -> Draining -> Stopped`
//!
//! Startup binds every worker before the relay counts as running; any
//! binding failure aborts startup. Shutdown stops workers one at a time in
//! index order and waits for each to drain. There is no forced timeout:
//! drain time is bounded only by the broker.

use std::future::Future;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::consumer::{Consumer, ConsumerError};
use crate::metrics::RelayMetrics;
use crate::state::StateStore;
use crate::worker::{ShutdownError, Worker, WorkerHandle, WorkerSummary};

/// Default consumer tag prefix; the hostname and worker index are appended
pub const DEFAULT_CONSUMER_TAG_PREFIX: &str = "stateservice-consumer";

/// Relay status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// Workers are being bound to the broker
    Starting,
    /// All workers are consuming
    Running,
    /// Intake is being stopped and in-flight deliveries drained
    Draining,
    /// Every worker shutdown has been attempted
    Stopped,
}

impl std::fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Number of workers, each with its own subscription
    pub workers: usize,

    /// Host identifier included in consumer tags
    pub hostname: String,

    /// Consumer tag prefix
    pub consumer_tag_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            hostname: "unknown".to_string(),
            consumer_tag_prefix: DEFAULT_CONSUMER_TAG_PREFIX.to_string(),
        }
    }
}

impl RelayConfig {
    /// Create a configuration with `workers` workers
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Set the hostname used in consumer tags
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Consumer tag for the worker at `index`
    pub fn consumer_tag(&self, index: usize) -> String {
        format!("{}-{}-{}", self.consumer_tag_prefix, self.hostname, index)
    }
}

/// Fatal startup errors
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Zero workers configured
    #[error("at least one worker is required")]
    NoWorkers,

    /// A worker could not be bound to the broker
    #[error("failed to bind worker {index}: {source}")]
    Bind {
        index: usize,
        #[source]
        source: ConsumerError,
    },
}

/// Result of draining every worker
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Workers that drained cleanly, in shutdown order
    pub drained: Vec<WorkerSummary>,

    /// Workers whose shutdown failed, by index
    pub failed: Vec<(usize, ShutdownError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Deliveries processed by the drained workers
    pub fn processed(&self) -> u64 {
        self.drained.iter().map(|s| s.processed).sum()
    }
}

/// Running relay: a pool of workers bound to the broker
///
/// # Example
///
/// ```ignore
/// use staterelay_core::{Relay, RelayConfig, shutdown_signal};
///
/// let relay = Relay::start(RelayConfig::new(4), &consumer, store, metrics).await?;
/// let report = relay
///     .run_until(async {
///         shutdown_signal().await;
///     })
///     .await;
/// ```
pub struct Relay {
    workers: Vec<WorkerHandle>,
    status: watch::Sender<RelayStatus>,
}

impl Relay {
    /// Bind `config.workers` workers to `consumer`.
    ///
    /// If any binding fails, the workers already started are shut down and
    /// the error is returned.
    pub async fn start(
        config: RelayConfig,
        consumer: &dyn Consumer,
        store: StateStore,
        metrics: RelayMetrics,
    ) -> Result<Self, StartupError> {
        let (status, _) = watch::channel(RelayStatus::Starting);
        Self::start_with_status(config, consumer, store, metrics, status).await
    }

    /// Like [`Relay::start`], reporting transitions on `status` from
    /// `Starting` onwards.
    ///
    /// Receivers subscribed before the call see `Starting` while workers are
    /// being bound, and `Stopped` if startup fails.
    #[instrument(skip_all, fields(workers = config.workers))]
    pub async fn start_with_status(
        config: RelayConfig,
        consumer: &dyn Consumer,
        store: StateStore,
        metrics: RelayMetrics,
        status: watch::Sender<RelayStatus>,
    ) -> Result<Self, StartupError> {
        status.send_replace(RelayStatus::Starting);

        if config.workers == 0 {
            status.send_replace(RelayStatus::Stopped);
            return Err(StartupError::NoWorkers);
        }

        let mut workers = Vec::with_capacity(config.workers);

        for index in 0..config.workers {
            let consumer_tag = config.consumer_tag(index);

            match consumer.subscribe(&consumer_tag).await {
                Ok(subscription) => {
                    let worker = Worker::new(index, store.clone(), metrics.clone());
                    workers.push(worker.spawn(subscription));
                }
                Err(source) => {
                    error!(index, error = %source, "Failed to bind worker, aborting startup");
                    drain(workers).await;
                    status.send_replace(RelayStatus::Stopped);
                    return Err(StartupError::Bind { index, source });
                }
            }
        }

        status.send_replace(RelayStatus::Running);
        info!(workers = workers.len(), "Relay running");

        Ok(Self { workers, status })
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    /// Watch status transitions
    pub fn subscribe_status(&self) -> watch::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run until `signal` completes, then drain every worker
    pub async fn run_until<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await
    }

    /// Stop every worker in index order, waiting for each to drain
    pub async fn shutdown(self) -> ShutdownReport {
        self.status.send_replace(RelayStatus::Draining);
        warn!(workers = self.workers.len(), "Shutting down consumers");

        let report = drain(self.workers).await;

        self.status.send_replace(RelayStatus::Stopped);
        info!(
            drained = report.drained.len(),
            failed = report.failed.len(),
            processed = report.processed(),
            "Relay stopped"
        );
        report
    }
}

async fn drain(workers: Vec<WorkerHandle>) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for handle in workers {
        let index = handle.index();
        info!(worker = index, "Shutting down consumer");

        match handle.shutdown().await {
            Ok(summary) => report.drained.push(summary),
            Err(e) => {
                error!(worker = index, error = %e, "Error during shutdown");
                report.failed.push((index, e));
            }
        }
    }

    report
}

/// Wait for SIGINT or, on unix, SIGTERM. Returns the signal name.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    }
}
