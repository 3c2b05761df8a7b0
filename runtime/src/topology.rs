//! Broker Topology Manager.
//!
//! Declares the durable queues the pipeline relies on. Declaration is
//! idempotent: repeating it with identical parameters is a no-op, so both the
//! publishing and the consuming side of each queue call it on every
//! (re)connection and either may start first.
//!
//! Each pipeline queue `q` has a durable dead-letter companion named
//! `q` + suffix (default `.dlq`).

use order_pipeline_core::broker::{BrokerChannel, BrokerError, QueueSpec};
use thiserror::Error;

/// Default dead-letter queue suffix.
pub const DEFAULT_DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Errors from topology declaration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// A queue exists with incompatible durability/exclusivity flags.
    ///
    /// Fatal at startup; needs operator action.
    #[error("Topology conflict on queue '{queue}': {reason}")]
    Conflict {
        /// Queue name
        queue: String,
        /// Broker-provided detail
        reason: String,
    },

    /// The declaration could not be performed.
    #[error("Failed to declare queue '{queue}': {source}")]
    Broker {
        /// Queue name
        queue: String,
        /// Underlying broker error
        #[source]
        source: BrokerError,
    },
}

impl TopologyError {
    /// Whether the failure is a connection fault that a reconnect may fix.
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        match self {
            Self::Conflict { .. } => false,
            Self::Broker { source, .. } => source.is_connection_level(),
        }
    }
}

/// Declares pipeline queues and their dead-letter companions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyManager {
    dead_letter_suffix: String,
}

impl Default for TopologyManager {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_SUFFIX)
    }
}

impl TopologyManager {
    /// Create a manager using `dead_letter_suffix` to name dead-letter queues.
    #[must_use]
    pub fn new(dead_letter_suffix: impl Into<String>) -> Self {
        Self {
            dead_letter_suffix: dead_letter_suffix.into(),
        }
    }

    /// Name of the dead-letter queue for `queue`.
    #[must_use]
    pub fn dead_letter_queue(&self, queue: &str) -> String {
        format!("{queue}{}", self.dead_letter_suffix)
    }

    /// Declare `name` as a shared, non-auto-deleting queue.
    ///
    /// A no-op if the queue exists with matching properties.
    ///
    /// # Errors
    ///
    /// - [`TopologyError::Conflict`] if the queue exists with different flags
    /// - [`TopologyError::Broker`] on any other broker failure
    pub async fn ensure_queue(
        &self,
        channel: &dyn BrokerChannel,
        name: &str,
        durable: bool,
    ) -> Result<(), TopologyError> {
        let spec = QueueSpec {
            durable,
            ..QueueSpec::durable(name)
        };
        declare(channel, &spec).await
    }

    /// Declare `name` and its dead-letter queue, both durable.
    ///
    /// # Errors
    ///
    /// See [`TopologyManager::ensure_queue`].
    pub async fn ensure_with_dead_letter(
        &self,
        channel: &dyn BrokerChannel,
        name: &str,
    ) -> Result<(), TopologyError> {
        self.ensure_queue(channel, name, true).await?;
        self.ensure_queue(channel, &self.dead_letter_queue(name), true)
            .await
    }

    /// Declare every queue in `names` together with its dead-letter queue.
    ///
    /// # Errors
    ///
    /// Stops at the first failing declaration.
    pub async fn ensure_all(
        &self,
        channel: &dyn BrokerChannel,
        names: &[&str],
    ) -> Result<(), TopologyError> {
        for name in names {
            self.ensure_with_dead_letter(channel, name).await?;
        }
        Ok(())
    }
}

async fn declare(channel: &dyn BrokerChannel, spec: &QueueSpec) -> Result<(), TopologyError> {
    match channel.declare_queue(spec).await {
        Ok(()) => {
            tracing::debug!(queue = %spec.name, durable = spec.durable, "Queue declared");
            Ok(())
        },
        Err(BrokerError::PreconditionFailed { queue, reason }) => {
            tracing::error!(queue = %queue, reason = %reason, "Queue exists with incompatible properties");
            Err(TopologyError::Conflict { queue, reason })
        },
        Err(source) => Err(TopologyError::Broker {
            queue: spec.name.clone(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_names() {
        assert_eq!(
            TopologyManager::default().dead_letter_queue("order_created"),
            "order_created.dlq"
        );
        assert_eq!(
            TopologyManager::new("-dead").dead_letter_queue("payment_completed"),
            "payment_completed-dead"
        );
    }

    #[test]
    fn conflict_is_not_connection_level() {
        let conflict = TopologyError::Conflict {
            queue: "q".into(),
            reason: "durable".into(),
        };
        assert!(!conflict.is_connection_level());

        let lost = TopologyError::Broker {
            queue: "q".into(),
            source: BrokerError::ConnectionLost("eof".into()),
        };
        assert!(lost.is_connection_level());
    }
}
