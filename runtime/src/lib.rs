//! # Order Pipeline Runtime
//!
//! The broker-facing machinery shared by every pipeline service.
//!
//! ## Core Components
//!
//! - **[`topology::TopologyManager`]**: idempotent declaration of durable queues
//!   and their dead-letter companions
//! - **[`publisher::Publisher`]**: confirmed, persistent publishing with bounded
//!   retry and reconnect
//! - **[`consumer::ConsumerLoop`]**: receive, process, then acknowledge; requeue
//!   or dead-letter on failure; reconnect on connection faults; drain on shutdown
//! - **[`stage::StageHandler`]**: adapts a business [`Stage`] to the consumer loop
//!
//! ## Example
//!
//! ```ignore
//! use order_pipeline_runtime::consumer::{ConsumerConfig, ConsumerLoop};
//! use order_pipeline_runtime::shutdown::ShutdownCoordinator;
//! use order_pipeline_runtime::stage::StageHandler;
//!
//! let publisher = Arc::new(Publisher::new(broker.clone()));
//! let handler = Arc::new(StageHandler::new(Arc::new(payment_stage), publisher));
//!
//! let consumer = ConsumerLoop::new(broker, ConsumerConfig::new("order_created"));
//! let report = consumer.run(handler, coordinator.signal()).await?;
//! ```
//!
//! [`Stage`]: order_pipeline_core::handler::Stage

/// Environment-based configuration
pub mod config;

/// The Consumer Loop
pub mod consumer;

/// Dead-letter records
pub mod dead_letter;

/// Prometheus metrics for observability
pub mod metrics;

/// Confirmed publishing with retry
pub mod publisher;

/// Retry logic with exponential backoff
pub mod retry;

/// Graceful shutdown coordination
pub mod shutdown;

/// Stage execution and the stage-to-handler adapter
pub mod stage;

/// Tracing subscriber setup
pub mod telemetry;

/// Queue declaration
pub mod topology;

pub use consumer::{ConsumerConfig, ConsumerError, ConsumerLoop, ConsumerReport, ConsumerState};
pub use publisher::{PublishError, Publisher};
pub use stage::{StageError, StageHandler, run_stage};
pub use topology::{TopologyError, TopologyManager};
