//! Startup and shutdown shared by the pipeline service binaries.
//!
//! Each binary follows the same sequence:
//!
//! 1. [`init`]: tracing, configuration, optional Prometheus exporter
//! 2. connect to the record store ([`connect_database`]) and the broker ([`broker`])
//! 3. build the stage and its consumer loop or HTTP router
//! 4. [`run_until_signal`]: run until the task ends or SIGTERM/Ctrl+C arrives,
//!    then drain and release resources through the [`ShutdownCoordinator`]
//!
//! A consumer loop that gives up (topology conflict, reconnect budget spent)
//! makes the binary exit non-zero.

use anyhow::Context;
use order_pipeline_amqp::AmqpBroker;
use order_pipeline_core::broker::Broker;
use order_pipeline_runtime::config::PipelineConfig;
use order_pipeline_runtime::metrics::MetricsServer;
use order_pipeline_runtime::publisher::Publisher;
use order_pipeline_runtime::retry::{RetryPolicy, retry_with_backoff};
use order_pipeline_runtime::shutdown::{GenericShutdownHandler, ShutdownCoordinator, wait_for_signal};
use order_pipeline_runtime::telemetry::init_tracing;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Pool size for each service's record store.
const DATABASE_POOL_SIZE: u32 = 5;

/// Extra time shutdown handlers get on top of the consumer drain timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Install tracing, load configuration and start the metrics exporter if
/// `METRICS_ADDR` is set.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the exporter cannot
/// be installed.
pub fn init(service: &'static str) -> anyhow::Result<PipelineConfig> {
    init_tracing("info").context("failed to install tracing subscriber")?;

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr)
            .start()
            .context("failed to start metrics exporter")?;
    }

    tracing::info!(
        service,
        concurrency = config.concurrency,
        prefetch = config.prefetch,
        max_redeliveries = config.max_redeliveries,
        dead_letter_suffix = ?config.dead_letter_suffix,
        "Starting"
    );
    Ok(config)
}

/// Broker connection named after the service.
#[must_use]
pub fn broker(service: &'static str, config: &PipelineConfig) -> Arc<dyn Broker> {
    let broker = AmqpBroker::builder()
        .url(config.amqp_url.clone())
        .connection_name(service)
        .build();
    tracing::info!(url = %broker.display_url(), "Broker configured");
    Arc::new(broker)
}

/// Publisher with the configured retry budget and dead-letter naming.
#[must_use]
pub fn publisher(config: &PipelineConfig, broker: Arc<dyn Broker>) -> Arc<Publisher> {
    Arc::new(
        Publisher::new(broker)
            .with_retry_policy(config.publish_retry_policy())
            .with_topology(config.topology()),
    )
}

/// Connect to `DATABASE_URL`, retrying while the database starts up.
///
/// # Errors
///
/// Returns an error if `DATABASE_URL` is unset or every attempt fails.
pub async fn connect_database(config: &PipelineConfig) -> anyhow::Result<PgPool> {
    let url = config.require_database_url()?;
    let policy = RetryPolicy::reconnect(config.reconnect_max_attempts);

    let pool = retry_with_backoff(policy, || order_pipeline_postgres::connect(url, DATABASE_POOL_SIZE))
        .await
        .context("database unavailable")?;
    Ok(pool)
}

/// Coordinator sized for the configured drain timeout.
#[must_use]
pub fn coordinator(config: &PipelineConfig) -> ShutdownCoordinator {
    ShutdownCoordinator::new(config.drain_timeout + SHUTDOWN_GRACE)
}

/// Register closing `publisher` on shutdown.
pub fn close_publisher_on_shutdown(coordinator: &mut ShutdownCoordinator, publisher: &Arc<Publisher>) {
    let publisher = Arc::clone(publisher);
    coordinator.register(Arc::new(GenericShutdownHandler::new("publisher", move || {
        let publisher = Arc::clone(&publisher);
        async move {
            publisher.close().await;
            Ok(())
        }
    })));
}

/// Register closing `pool` on shutdown.
pub fn close_pool_on_shutdown(coordinator: &mut ShutdownCoordinator, pool: &PgPool) {
    let pool = pool.clone();
    coordinator.register(Arc::new(GenericShutdownHandler::new("database", move || {
        let pool = pool.clone();
        async move {
            pool.close().await;
            Ok(())
        }
    })));
}

/// Run `task` until it finishes or a termination signal arrives.
///
/// On a signal the coordinator's shutdown signal fires and `task` is awaited
/// to completion (consumers drain, servers finish in-flight requests). The
/// registered handlers then run.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn run_until_signal<F>(coordinator: &ShutdownCoordinator, task: F) -> anyhow::Result<F::Output>
where
    F: Future,
{
    tokio::pin!(task);

    let output = tokio::select! {
        output = &mut task => output,
        signal = wait_for_signal() => {
            signal.context("failed to install signal handlers")?;
            tracing::info!("Shutdown requested, draining");
            coordinator.trigger();
            task.await
        }
    };

    if let Err(errors) = coordinator.shutdown().await {
        tracing::warn!(errors = ?errors, "Some components did not shut down cleanly");
    }
    Ok(output)
}
