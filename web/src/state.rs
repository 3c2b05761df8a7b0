//! Shared state for the two HTTP services.

use order_pipeline_stages::OrderService;
use std::sync::Arc;
use std::time::Duration;

/// State of the order service.
#[derive(Clone, Debug)]
pub struct OrderServiceState {
    /// Order intake
    pub orders: Arc<OrderService>,
}

impl OrderServiceState {
    /// Create the state.
    #[must_use]
    pub const fn new(orders: Arc<OrderService>) -> Self {
        Self { orders }
    }
}

/// State of the gateway.
#[derive(Clone, Debug)]
pub struct GatewayState {
    /// HTTP client used for forwarding
    pub client: reqwest::Client,
    /// Base URL of the order service, without trailing slash
    pub order_service_url: String,
}

impl GatewayState {
    /// Default timeout for forwarded requests.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create the state with a client using [`Self::DEFAULT_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(order_service_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Self::DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, order_service_url))
    }

    /// Create the state around an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, order_service_url: impl Into<String>) -> Self {
        let order_service_url = order_service_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            order_service_url,
        }
    }

    /// URL of the order service's intake endpoint.
    #[must_use]
    pub fn orders_url(&self) -> String {
        format!("{}/api/orders", self.order_service_url)
    }
}
