//! Running a [`Stage`] and adapting it to the Consumer Loop.
//!
//! [`run_stage`] is the single canonical sequence every stage goes through:
//! validate, apply, then publish the next event. A non-terminal stage that
//! produces no next event is a postcondition violation, never an alternate
//! mode.
//!
//! [`StageHandler`] wraps a queue-fed stage as a [`MessageHandler`] and maps
//! [`StageError`]s onto the transient/permanent taxonomy.

use crate::publisher::{PublishError, Publisher};
use order_pipeline_core::domain::ValidationError;
use order_pipeline_core::event::{DomainEvent, Envelope};
use order_pipeline_core::handler::{HandlerError, HandlerFuture, MessageHandler, Stage};
use order_pipeline_core::record_store::StoreError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Failure while running a stage.
#[derive(Error, Debug)]
pub enum StageError {
    /// The input failed the stage's business rules.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The next event could not be published.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// A non-terminal stage produced no next event.
    #[error("Stage '{0}' produced no next event")]
    MissingNextEvent(&'static str),

    /// The stage emits events but has no publisher.
    #[error("Stage '{0}' has no publisher for its next event")]
    MissingPublisher(&'static str),
}

impl From<StageError> for HandlerError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Validation(e) => e.into(),
            StageError::Store(e) => e.into(),
            StageError::Publish(PublishError::Unavailable { .. } | PublishError::Closed) => {
                Self::Transient(err.to_string())
            },
            StageError::Publish(PublishError::Encode(_) | PublishError::Topology(_))
            | StageError::MissingNextEvent(_)
            | StageError::MissingPublisher(_) => Self::Permanent(err.to_string()),
        }
    }
}

/// Validate, apply and emit.
///
/// Returns the record and the envelope that was published, if any. The
/// emitted envelope's `causation_id` is `causation_id`.
///
/// # Errors
///
/// Returns [`StageError`] for the first step that fails. A failed publish
/// leaves the record in place; re-running the (idempotent) stage re-emits.
pub async fn run_stage<S: Stage>(
    stage: &S,
    publisher: Option<&Publisher>,
    input: S::Input,
    causation_id: Option<Uuid>,
) -> Result<(S::Record, Option<Envelope>), StageError> {
    let validated = stage.validate(input)?;
    let record = stage.apply(validated).await?;

    let Some(event) = stage.next_event(&record) else {
        if S::TERMINAL {
            return Ok((record, None));
        }
        tracing::error!(stage = S::NAME, "Non-terminal stage produced no next event");
        return Err(StageError::MissingNextEvent(S::NAME));
    };

    let Some(publisher) = publisher else {
        tracing::error!(stage = S::NAME, event_type = event.event_type(), "No publisher configured");
        return Err(StageError::MissingPublisher(S::NAME));
    };

    let envelope = publisher.publish_event(event, causation_id).await?;
    Ok((record, Some(envelope)))
}

/// [`MessageHandler`] for a queue-fed stage.
pub struct StageHandler<S> {
    stage: Arc<S>,
    publisher: Option<Arc<Publisher>>,
}

impl<S> fmt::Debug for StageHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageHandler")
            .field("publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: Stage> StageHandler<S> {
    /// Handler for a stage that publishes its next event through `publisher`.
    #[must_use]
    pub const fn new(stage: Arc<S>, publisher: Arc<Publisher>) -> Self {
        Self {
            stage,
            publisher: Some(publisher),
        }
    }

    /// Handler for a terminal stage.
    #[must_use]
    pub const fn terminal(stage: Arc<S>) -> Self {
        Self {
            stage,
            publisher: None,
        }
    }

    /// The wrapped stage.
    #[must_use]
    pub fn stage(&self) -> &S {
        &self.stage
    }
}

impl<S> MessageHandler for StageHandler<S>
where
    S: Stage,
    S::Input: TryFrom<DomainEvent>,
{
    fn handle(&self, envelope: Envelope) -> HandlerFuture<'_> {
        Box::pin(async move {
            let message_id = envelope.message_id;
            let order_id = envelope.event.order_id();
            let event_type = envelope.event.event_type();

            let input = S::Input::try_from(envelope.event).map_err(|_| {
                HandlerError::Permanent(format!(
                    "stage '{}' does not accept '{event_type}' events",
                    S::NAME
                ))
            })?;

            let (_, emitted) = run_stage(
                self.stage.as_ref(),
                self.publisher.as_deref(),
                input,
                Some(message_id),
            )
            .await
            .map_err(|e| {
                tracing::debug!(stage = S::NAME, %message_id, %order_id, error = %e, "Stage failed");
                HandlerError::from(e)
            })?;

            tracing::debug!(
                stage = S::NAME,
                %message_id,
                %order_id,
                emitted = ?emitted.as_ref().map(|e| e.message_id),
                "Stage applied"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyError;

    #[test]
    fn publish_unavailability_is_transient() {
        let err = StageError::Publish(PublishError::Unavailable {
            queue: "payment_completed".into(),
            attempts: 6,
            reason: "connection refused".into(),
        });
        assert!(HandlerError::from(err).is_transient());
    }

    #[test]
    fn downstream_topology_conflict_is_permanent() {
        let err = StageError::Publish(PublishError::Topology(TopologyError::Conflict {
            queue: "payment_completed".into(),
            reason: "durable=false".into(),
        }));
        assert!(!HandlerError::from(err).is_transient());
    }

    #[test]
    fn postcondition_violation_is_permanent() {
        let err = HandlerError::from(StageError::MissingNextEvent("payment"));
        assert_eq!(
            err,
            HandlerError::Permanent("Stage 'payment' produced no next event".into())
        );
    }

    #[test]
    fn validation_is_permanent() {
        let err = StageError::from(ValidationError::Missing { field: "order_id" });
        assert!(!HandlerError::from(err).is_transient());
    }
}
