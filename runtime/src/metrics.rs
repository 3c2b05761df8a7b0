//! Prometheus metrics for the pipeline.
//!
//! Failures inside the asynchronous stages never reach the original HTTP
//! caller, so these counters (together with dead-letter queues) are how an
//! operator sees them.
//!
//! # Example
//!
//! ```rust,no_run
//! use order_pipeline_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Messages consumed, labelled by queue and outcome.
pub const MESSAGES_CONSUMED: &str = "pipeline_messages_consumed_total";
/// Handler latency.
pub const HANDLER_DURATION: &str = "pipeline_handler_duration_seconds";
/// Messages confirmed by the broker.
pub const MESSAGES_PUBLISHED: &str = "pipeline_messages_published_total";
/// Publish attempts that were retried.
pub const PUBLISH_RETRIES: &str = "pipeline_publish_retries_total";
/// Publishes that exhausted their retries.
pub const PUBLISH_FAILURES: &str = "pipeline_publish_failures_total";
/// Messages routed to a dead-letter queue.
pub const DEAD_LETTERS: &str = "pipeline_dead_letters_total";
/// Consumer reconnections.
pub const CONSUMER_RECONNECTS: &str = "pipeline_consumer_reconnects_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build or install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(#[from] BuildError),
}

/// Prometheus exporter serving `/metrics` over HTTP.
#[derive(Debug, Clone, Copy)]
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` (e.g. `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Address the exporter listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Install the global recorder and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime, at most once per process.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a recorder is already installed or
    /// the listener cannot be set up.
    pub fn start(&self) -> Result<(), MetricsError> {
        register_metrics();

        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )?
            .install()?;

        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        MESSAGES_CONSUMED,
        "Messages consumed, by queue and outcome (acked, requeued, dead_lettered, discarded)"
    );
    describe_histogram!(HANDLER_DURATION, "Time taken by stage handlers");
    describe_counter!(MESSAGES_PUBLISHED, "Messages confirmed by the broker");
    describe_counter!(PUBLISH_RETRIES, "Publish attempts that were retried");
    describe_counter!(PUBLISH_FAILURES, "Publishes that exhausted their retries");
    describe_counter!(DEAD_LETTERS, "Messages routed to a dead-letter queue, by reason");
    describe_counter!(CONSUMER_RECONNECTS, "Consumer reconnections after a connection fault");
}

/// Consumer loop metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record how a delivery was settled.
    pub fn record_outcome(queue: &str, outcome: &'static str) {
        counter!(MESSAGES_CONSUMED, "queue" => queue.to_owned(), "outcome" => outcome)
            .increment(1);
    }

    /// Record a handler invocation.
    pub fn record_handler_duration(queue: &str, duration: Duration) {
        histogram!(HANDLER_DURATION, "queue" => queue.to_owned()).record(duration.as_secs_f64());
    }

    /// Record a dead-lettered message.
    pub fn record_dead_letter(queue: &str, reason: &'static str) {
        counter!(DEAD_LETTERS, "queue" => queue.to_owned(), "reason" => reason).increment(1);
    }

    /// Record a reconnection.
    pub fn record_reconnect(queue: &str) {
        counter!(CONSUMER_RECONNECTS, "queue" => queue.to_owned()).increment(1);
    }
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a confirmed publish.
    pub fn record_published(queue: &str) {
        counter!(MESSAGES_PUBLISHED, "queue" => queue.to_owned()).increment(1);
    }

    /// Record a retried attempt.
    pub fn record_retry(queue: &str) {
        counter!(PUBLISH_RETRIES, "queue" => queue.to_owned()).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_failure(queue: &str) {
        counter!(PUBLISH_FAILURES, "queue" => queue.to_owned()).increment(1);
    }
}
