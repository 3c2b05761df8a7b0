//! Gateway: forwards `POST /api/orders` to the order service.

use order_pipeline_services::{coordinator, init, run_until_signal};
use order_pipeline_web::{GatewayState, gateway_router, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = init("gateway")?;

    let state = GatewayState::new(config.order_service_url.clone())?;
    tracing::info!(order_service = %state.order_service_url, "Forwarding orders");

    let coordinator = coordinator(&config);
    let server = serve(config.http_addr, gateway_router(state), coordinator.signal());
    run_until_signal(&coordinator, server).await??;

    tracing::info!("Gateway stopped");
    Ok(())
}
