//! Prometheus metrics for the relay
//!
//! Metrics are registered against an explicit [`Registry`] and handed to each
//! worker, so tests can build isolated instances.

use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

/// Latency buckets in seconds, 0.5ms to 5s
const PROCESSING_TIME_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Counters and timers shared by all workers
#[derive(Clone)]
pub struct RelayMetrics {
    /// Deliveries taken off the broker, whatever their outcome
    pub messages_processed: IntCounter,

    /// Time from receipt to acknowledgment per delivery
    pub processing_time: Histogram,
}

impl RelayMetrics {
    /// Create the relay metrics and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages_processed = IntCounter::new(
            "timeseries_messages_processed_total",
            "Number of state messages processed",
        )?;

        let processing_time = Histogram::with_opts(
            HistogramOpts::new(
                "timeseries_messages_processed_time_seconds",
                "Time taken to persist and acknowledge a state message",
            )
            .buckets(PROCESSING_TIME_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(processing_time.clone()))?;

        Ok(Self {
            messages_processed,
            processing_time,
        })
    }

    pub fn record_processed(&self) {
        self.messages_processed.inc();
    }

    pub fn record_processing_time(&self, elapsed: Duration) {
        self.processing_time.observe(elapsed.as_secs_f64());
    }

    pub fn processed_count(&self) -> u64 {
        self.messages_processed.get()
    }

    pub fn processing_time_samples(&self) -> u64 {
        self.processing_time.get_sample_count()
    }
}

/// Register CPU, memory, file descriptor and thread metrics for this process.
///
/// Only Linux exposes them; elsewhere this is a no-op.
pub fn register_process_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    #[cfg(target_os = "linux")]
    registry.register(Box::new(
        prometheus::process_collector::ProcessCollector::for_self(),
    ))?;

    #[cfg(not(target_os = "linux"))]
    let _ = registry;

    Ok(())
}

/// Render every metric in `registry` in the Prometheus text format
pub fn gather(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        let registry = Registry::new();
        let metrics = RelayMetrics::new(&registry).unwrap();

        metrics.record_processed();
        metrics.record_processed();
        metrics.record_processing_time(Duration::from_millis(3));

        assert_eq!(metrics.processed_count(), 2);
        assert_eq!(metrics.processing_time_samples(), 1);
    }

    #[test]
    fn test_clones_share_values() {
        let registry = Registry::new();
        let metrics = RelayMetrics::new(&registry).unwrap();
        let clone = metrics.clone();

        clone.record_processed();

        assert_eq!(metrics.processed_count(), 1);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        RelayMetrics::new(&registry).unwrap();

        assert!(RelayMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_gather_text_format() {
        let registry = Registry::new();
        let metrics = RelayMetrics::new(&registry).unwrap();
        metrics.record_processed();

        let text = gather(&registry).unwrap();

        assert!(text.contains("timeseries_messages_processed_total 1"));
        assert!(text.contains("timeseries_messages_processed_time_seconds_count 0"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_metrics_in_text_format() {
        let registry = Registry::new();
        register_process_metrics(&registry).unwrap();

        let text = gather(&registry).unwrap();

        assert!(text.lines().any(|line| line.starts_with("process_")));
    }
}
