//! Payment service: consumes `order_created`, records a payment, publishes
//! `payment_completed`.

use anyhow::Context;
use order_pipeline_core::{ORDER_CREATED_QUEUE, PAYMENT_COMPLETED_QUEUE};
use order_pipeline_postgres::PgPaymentStore;
use order_pipeline_runtime::consumer::ConsumerLoop;
use order_pipeline_runtime::stage::StageHandler;
use order_pipeline_services::{
    broker, close_pool_on_shutdown, close_publisher_on_shutdown, connect_database, coordinator,
    init, publisher, run_until_signal,
};
use order_pipeline_stages::PaymentStage;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = init("payment-service")?;

    let pool = connect_database(&config).await?;
    let store = PgPaymentStore::new(pool.clone());
    store.ensure_schema().await?;

    let broker = broker("payment-service", &config);
    let publisher = publisher(&config, Arc::clone(&broker));
    publisher
        .declare(PAYMENT_COMPLETED_QUEUE)
        .await
        .context("cannot declare the payment_completed queue")?;
    let stage = PaymentStage::new(Arc::new(store));
    let handler = Arc::new(StageHandler::new(Arc::new(stage), Arc::clone(&publisher)));

    let consumer = ConsumerLoop::new(broker, config.consumer_config(ORDER_CREATED_QUEUE));

    let mut coordinator = coordinator(&config);
    close_publisher_on_shutdown(&mut coordinator, &publisher);
    close_pool_on_shutdown(&mut coordinator, &pool);

    let report = run_until_signal(&coordinator, consumer.run(handler, coordinator.signal())).await??;

    tracing::info!(
        acked = report.acked,
        requeued = report.requeued,
        dead_lettered = report.dead_lettered,
        reconnects = report.reconnects,
        "Payment service stopped"
    );
    Ok(())
}
