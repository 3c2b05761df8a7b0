//! Order service: HTTP intake that stores orders and publishes `order_created`.

use anyhow::Context;
use order_pipeline_core::ORDER_CREATED_QUEUE;
use order_pipeline_postgres::PgOrderStore;
use order_pipeline_services::{
    broker, close_pool_on_shutdown, close_publisher_on_shutdown, connect_database, coordinator,
    init, publisher, run_until_signal,
};
use order_pipeline_stages::OrderService;
use order_pipeline_web::{OrderServiceState, order_service_router, serve};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = init("order-service")?;

    let pool = connect_database(&config).await?;
    let store = PgOrderStore::new(pool.clone());
    store.ensure_schema().await?;

    let broker = broker("order-service", &config);
    let publisher = publisher(&config, broker);
    publisher
        .declare(ORDER_CREATED_QUEUE)
        .await
        .context("cannot declare the order_created queue")?;
    let orders = OrderService::new(Arc::new(store), Arc::clone(&publisher));
    let router = order_service_router(OrderServiceState::new(Arc::new(orders)));

    let mut coordinator = coordinator(&config);
    close_publisher_on_shutdown(&mut coordinator, &publisher);
    close_pool_on_shutdown(&mut coordinator, &pool);

    let server = serve(config.http_addr, router, coordinator.signal());
    run_until_signal(&coordinator, server).await??;

    tracing::info!("Order service stopped");
    Ok(())
}
