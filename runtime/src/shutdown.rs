//! Graceful shutdown coordination.
//!
//! ## Architecture
//!
//! - [`ShutdownSignal`]: cloneable, level-triggered signal that consumer loops
//!   and HTTP servers watch to stop accepting new work
//! - [`ShutdownHandler`]: components that release resources on shutdown
//!   (publisher channels, database pools)
//! - [`ShutdownCoordinator`]: triggers the signal, then runs every handler in
//!   parallel with a timeout
//! - [`wait_for_signal`]: waits for SIGTERM or Ctrl+C
//!
//! ## Usage
//!
//! ```ignore
//! let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
//! coordinator.register(Arc::new(GenericShutdownHandler::new("publisher", ...)));
//!
//! let consumer = tokio::spawn(consumer_loop.run(handler, coordinator.signal()));
//!
//! wait_for_signal().await?;
//! coordinator.shutdown().await?;
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Receiving side of a shutdown notification.
///
/// Once triggered it stays triggered; late subscribers see it immediately.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side of a shutdown notification.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    /// Create a connected trigger/signal pair.
    #[must_use]
    pub fn pair() -> (ShutdownTrigger, Self) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Self { rx })
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested. A dropped trigger counts as a request.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|triggered| *triggered).await.is_err() {
            tracing::debug!("Shutdown trigger dropped");
        }
    }
}

impl ShutdownTrigger {
    /// Request shutdown.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// A new signal connected to this trigger.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Trait for components that need graceful shutdown.
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    /// Component name for logging
    fn name(&self) -> &str;

    /// Release resources held by this component.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure.
    async fn shutdown(&self) -> Result<(), String>;
}

/// Coordinates shutdown across multiple components.
pub struct ShutdownCoordinator {
    handlers: Vec<Arc<dyn ShutdownHandler>>,
    trigger: ShutdownTrigger,
    timeout_duration: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator giving each handler at most `timeout` to finish.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let (trigger, _) = ShutdownSignal::pair();
        Self {
            handlers: Vec::new(),
            trigger,
            timeout_duration: timeout,
        }
    }

    /// Register a shutdown handler.
    ///
    /// Handlers are shut down in parallel, not in registration order.
    pub fn register(&mut self, handler: Arc<dyn ShutdownHandler>) {
        info!(component = handler.name(), "Registered shutdown handler");
        self.handlers.push(handler);
    }

    /// A signal that fires when [`ShutdownCoordinator::shutdown`] starts.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        self.trigger.signal()
    }

    /// Fire the signal without running handlers.
    pub fn trigger(&self) {
        self.trigger.trigger();
    }

    /// Fire the signal, then shut down all handlers in parallel.
    ///
    /// # Errors
    ///
    /// Returns one message per component that failed or timed out.
    pub async fn shutdown(&self) -> Result<(), Vec<String>> {
        info!(
            components = self.handlers.len(),
            timeout = ?self.timeout_duration,
            "Initiating graceful shutdown"
        );

        self.trigger.trigger();

        let shutdown_futures: Vec<_> = self
            .handlers
            .iter()
            .map(|handler| async move {
                let name = handler.name();
                match tokio::time::timeout(self.timeout_duration, handler.shutdown()).await {
                    Ok(Ok(())) => {
                        info!(component = name, "Component shut down");
                        Ok(())
                    },
                    Ok(Err(e)) => {
                        error!(component = name, error = %e, "Component shutdown failed");
                        Err(format!("{name}: {e}"))
                    },
                    Err(_) => {
                        error!(component = name, "Component shutdown timed out");
                        Err(format!("{name}: timeout after {:?}", self.timeout_duration))
                    },
                }
            })
            .collect();

        let errors: Vec<String> = futures::future::join_all(shutdown_futures)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if errors.is_empty() {
            info!("All components shut down");
            Ok(())
        } else {
            warn!(failures = errors.len(), "Shutdown completed with errors");
            Err(errors)
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

type ShutdownFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

/// Shutdown handler built from a closure.
///
/// ```ignore
/// let handler = GenericShutdownHandler::new("publisher", move || {
///     let publisher = Arc::clone(&publisher);
///     async move {
///         publisher.close().await;
///         Ok(())
///     }
/// });
/// ```
pub struct GenericShutdownHandler {
    name: String,
    on_shutdown: ShutdownFn,
}

impl GenericShutdownHandler {
    /// Create a handler named `name` that runs `on_shutdown`.
    pub fn new<F, Fut>(name: impl Into<String>, on_shutdown: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            on_shutdown: Arc::new(move || Box::pin(on_shutdown())),
        }
    }
}

#[async_trait]
impl ShutdownHandler for GenericShutdownHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), String> {
        (self.on_shutdown)().await
    }
}

/// Wait for Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
