//! # Order Pipeline Core
//!
//! Core traits and types for a message-driven order-processing pipeline.
//!
//! Three independent services cooperate through durable queues:
//!
//! ```text
//! ┌───────────────┐  order_created   ┌───────────────┐  payment_completed  ┌────────────────────┐
//! │ Order intake  │ ───────────────► │   Payment     │ ──────────────────► │ Notification/audit │
//! │ (HTTP)        │      queue       │   stage       │        queue        │ stage              │
//! └───────────────┘                  └───────────────┘                     └────────────────────┘
//! ```
//!
//! No stage calls another directly. Each arrow is a durable queue and every
//! consumer is idempotent, so at-least-once delivery converges to exactly one
//! `Payment` and one `PaymentLog` per order.
//!
//! ## Modules
//!
//! - [`domain`]: `Order`, `Payment`, `PaymentLog` and input validation
//! - [`event`]: the versioned JSON [`event::Envelope`] that crosses the broker
//! - [`broker`]: connection, channel and delivery abstractions over a queue broker
//! - [`record_store`]: the opaque persistence boundary each service owns
//! - [`handler`]: message handlers, stage contract and the handler error taxonomy
//! - [`environment`]: injected clock

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod domain;
pub mod event;
pub mod handler;
pub mod record_store;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Queue carrying `order_created` envelopes from the order service to the payment stage.
pub const ORDER_CREATED_QUEUE: &str = "order_created";

/// Queue carrying `payment_completed` envelopes from the payment stage to the notification stage.
pub const PAYMENT_COMPLETED_QUEUE: &str = "payment_completed";

/// Environment module - dependency injection traits
///
/// External time is abstracted behind [`environment::Clock`] so stage output
/// (`created_at`, `notified_at`, `occurred_at`) is deterministic in tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use order_pipeline_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let now = clock.now();
    /// assert!(now.timestamp() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
