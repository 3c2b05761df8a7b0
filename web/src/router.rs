//! Routers and the HTTP server loop.

use crate::handlers::{create_order, forward_order, health_check};
use crate::middleware::correlation_id_layer;
use crate::state::{GatewayState, OrderServiceState};
use axum::{
    Router,
    routing::{get, post},
};
use order_pipeline_runtime::shutdown::ShutdownSignal;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Upper bound on a single request, forwarding included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Routes of the order service.
pub fn order_service_router(state: OrderServiceState) -> Router {
    Router::new()
        .route("/api/orders", post(create_order))
        .route("/health", get(health_check))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(correlation_id_layer())
        .with_state(state)
}

/// Routes of the gateway.
pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/orders", post(forward_order))
        .route("/health", get(health_check))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(correlation_id_layer())
        .with_state(state)
}

/// Serve `router` on `addr` until `shutdown` fires, then finish in-flight
/// requests.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be bound.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    mut shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}
