//! # Order Pipeline Stages
//!
//! The three business stages of the pipeline:
//!
//! | Stage                  | Input              | Record       | Emits               |
//! |------------------------|--------------------|--------------|---------------------|
//! | [`OrderIntake`]        | HTTP order request | `Order`      | `order_created`     |
//! | [`PaymentStage`]       | `order_created`    | `Payment`    | `payment_completed` |
//! | [`NotificationStage`]  | `payment_completed`| `PaymentLog` | nothing (terminal)  |
//!
//! Payment and notification are idempotent by `order_id`: a redelivered event
//! finds the existing record instead of writing a second one. The payment
//! stage re-emits `payment_completed` on every successful invocation, so a
//! duplicate-suppressed write never starves the notification stage.
//!
//! Queue-fed stages are wrapped in a
//! [`StageHandler`](order_pipeline_runtime::StageHandler) and run by the
//! consumer loop. Order intake is driven synchronously by [`OrderService`].

/// Order intake and the order service
pub mod intake;

/// Payment log recording
pub mod notification;

/// Payment creation
pub mod payment;

pub use intake::{IntakeError, OrderIntake, OrderService, OrderStore, PlacedOrder};
pub use notification::{NotificationStage, PaymentLogStore};
pub use payment::{PaymentStage, PaymentStore};
