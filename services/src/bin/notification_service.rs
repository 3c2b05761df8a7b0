//! Notification service: consumes `payment_completed` and writes one payment
//! log per order.

use order_pipeline_core::PAYMENT_COMPLETED_QUEUE;
use order_pipeline_postgres::PgPaymentLogStore;
use order_pipeline_runtime::consumer::ConsumerLoop;
use order_pipeline_runtime::stage::StageHandler;
use order_pipeline_services::{
    broker, close_pool_on_shutdown, connect_database, coordinator, init, run_until_signal,
};
use order_pipeline_stages::NotificationStage;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = init("notification-service")?;

    let pool = connect_database(&config).await?;
    let store = PgPaymentLogStore::new(pool.clone());
    store.ensure_schema().await?;

    let broker = broker("notification-service", &config);
    let handler = Arc::new(StageHandler::terminal(Arc::new(NotificationStage::new(
        Arc::new(store),
    ))));

    let consumer = ConsumerLoop::new(broker, config.consumer_config(PAYMENT_COMPLETED_QUEUE));

    let mut coordinator = coordinator(&config);
    close_pool_on_shutdown(&mut coordinator, &pool);

    let report = run_until_signal(&coordinator, consumer.run(handler, coordinator.signal())).await??;

    tracing::info!(
        acked = report.acked,
        requeued = report.requeued,
        dead_lettered = report.dead_lettered,
        reconnects = report.reconnects,
        "Notification service stopped"
    );
    Ok(())
}
