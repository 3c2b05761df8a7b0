//! Message handlers and the stage contract.
//!
//! The Consumer Loop invokes a [`MessageHandler`] for every decoded envelope and
//! settles the delivery from the result:
//!
//! | Result                          | Fate                                          |
//! |---------------------------------|-----------------------------------------------|
//! | `Ok(())`                        | acknowledge                                   |
//! | `Err(HandlerError::Transient)`  | requeue, dead-letter past the redelivery limit |
//! | `Err(HandlerError::Permanent)`  | dead-letter (or discard)                      |
//!
//! A handler must only return `Ok` once its side effects, including any
//! downstream publish, are durable.
//!
//! A [`Stage`] is the business half of a handler: validate the input, apply it
//! to the service's record store, and name the next event in the chain. The
//! runtime crate adapts a `Stage` into a `MessageHandler`.

use crate::domain::ValidationError;
use crate::event::{DomainEvent, Envelope};
use crate::record_store::StoreError;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Outcome classification of a failed handler invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// A dependency is temporarily unavailable; the message should be retried.
    #[error("Transient handler failure: {0}")]
    Transient(String),

    /// The message can never be applied; retrying is pointless.
    #[error("Permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Whether the message should be requeued.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) | StoreError::Conflict { .. } => {
                Self::Transient(err.to_string())
            },
            StoreError::Validation(_) => Self::Permanent(err.to_string()),
        }
    }
}

impl From<ValidationError> for HandlerError {
    fn from(err: ValidationError) -> Self {
        Self::Permanent(err.to_string())
    }
}

/// Future returned by [`MessageHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Processes one decoded envelope.
///
/// Implementations must be idempotent: the same envelope may be delivered more
/// than once.
pub trait MessageHandler: Send + Sync {
    /// Handle an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] classifying the failure as transient or permanent.
    fn handle(&self, envelope: Envelope) -> HandlerFuture<'_>;
}

/// Per-service business logic: validate, apply, emit.
///
/// `validate` is pure; `apply` performs the record store side effect and must
/// be idempotent by `order_id`; `next_event` describes what the stage emits
/// after a successful apply.
pub trait Stage: Send + Sync + 'static {
    /// Name used in logs and metrics.
    const NAME: &'static str;

    /// Terminal stages emit nothing. A non-terminal stage whose `next_event`
    /// returns `None` violates its postcondition.
    const TERMINAL: bool;

    /// Raw input. Queue-fed stages extract it from a [`DomainEvent`].
    type Input: Send + 'static;
    /// Input that passed validation.
    type Validated: Send + 'static;
    /// Record written (or found) by `apply`.
    type Record: Send + Sync + 'static;

    /// Check the input against the stage's business rules.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the input can never be applied.
    fn validate(&self, input: Self::Input) -> Result<Self::Validated, ValidationError>;

    /// Apply the validated input to the record store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unavailable or refuses the record.
    fn apply(
        &self,
        validated: Self::Validated,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Record, StoreError>> + Send + '_>>;

    /// The event to publish after `apply` succeeded, if any.
    fn next_event(&self, record: &Self::Record) -> Option<DomainEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderId;

    #[test]
    fn store_errors_classify() {
        assert!(HandlerError::from(StoreError::Unavailable("down".into())).is_transient());
        assert!(
            HandlerError::from(StoreError::Conflict {
                order_id: OrderId::new(3)
            })
            .is_transient()
        );
        assert!(
            !HandlerError::from(StoreError::Validation(ValidationError::Missing {
                field: "status"
            }))
            .is_transient()
        );
    }

    #[test]
    fn validation_is_permanent() {
        let err = HandlerError::from(ValidationError::Missing { field: "order_id" });
        assert_eq!(
            err,
            HandlerError::Permanent("The order_id field is required.".to_string())
        );
    }
}
