//! Publisher with delivery confirmation and bounded retry.
//!
//! A [`Publisher`] owns one long-lived broker channel, created lazily and
//! re-created after any failure. Publishing is serialized through that channel.
//!
//! Each attempt: (re)connect if needed, declare the target queue and its
//! dead-letter companion, publish a persistent message, and wait for the
//! broker's confirm. Publishes are mandatory: if the queue was deleted since
//! it was declared, the broker returns the message and the attempt fails.
//! Failed attempts drop the channel, and with it the record of declared
//! queues, then back off before the next one. Once retries are exhausted the
//! caller gets [`PublishError::Unavailable`] and must fail the triggering
//! business action visibly.

use crate::metrics::PublisherMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::topology::{TopologyError, TopologyManager};
use order_pipeline_core::broker::{Broker, BrokerChannel, BrokerError, OutboundMessage};
use order_pipeline_core::environment::{Clock, SystemClock};
use order_pipeline_core::event::{DomainEvent, EncodeError, Envelope};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Header carrying the envelope's event type.
pub const EVENT_TYPE_HEADER: &str = "x-event-type";

/// Errors from publishing.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The envelope could not be serialized.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The broker could not be reached or did not confirm within the retry budget.
    #[error("Publish to '{queue}' unavailable after {attempts} attempts: {reason}")]
    Unavailable {
        /// Target queue
        queue: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// The target queue exists with incompatible properties.
    #[error(transparent)]
    Topology(TopologyError),

    /// [`Publisher::close`] was called.
    #[error("Publisher is closed")]
    Closed,
}

#[derive(Debug)]
enum AttemptError {
    Broker(BrokerError),
    Topology(TopologyError),
}

impl AttemptError {
    const fn is_retryable(&self) -> bool {
        match self {
            Self::Broker(_) => true,
            Self::Topology(e) => e.is_connection_level(),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broker(e) => write!(f, "{e}"),
            Self::Topology(e) => write!(f, "{e}"),
        }
    }
}

struct Session {
    channel: Box<dyn BrokerChannel>,
    declared: HashSet<String>,
}

/// Serializes envelopes and publishes them with confirmation.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    topology: TopologyManager,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    session: Mutex<Option<Session>>,
    closed: AtomicBool,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("topology", &self.topology)
            .field("policy", &self.policy)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Create a publisher with the default retry policy and system clock.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            topology: TopologyManager::default(),
            policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the topology manager (dead-letter naming).
    #[must_use]
    pub fn with_topology(mut self, topology: TopologyManager) -> Self {
        self.topology = topology;
        self
    }

    /// Set the clock used for `occurred_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wrap `event` in a fresh envelope and publish it to its queue.
    ///
    /// Returns the envelope that was confirmed by the broker.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn publish_event(
        &self,
        event: DomainEvent,
        causation_id: Option<Uuid>,
    ) -> Result<Envelope, PublishError> {
        let mut envelope = Envelope::new(event, self.clock.now());
        envelope.causation_id = causation_id;
        self.publish(envelope.event.queue_name(), &envelope).await?;
        Ok(envelope)
    }

    /// Publish an envelope to `queue` and wait for the broker's confirm.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Encode`] if the envelope cannot be serialized
    /// - [`PublishError::Topology`] if the queue exists with incompatible properties
    /// - [`PublishError::Unavailable`] once the retry budget is exhausted
    /// - [`PublishError::Closed`] after [`Publisher::close`]
    pub async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }

        let message = OutboundMessage::json(envelope.message_id, envelope.to_bytes()?)
            .with_header(EVENT_TYPE_HEADER, envelope.event.event_type());

        let attempts = AtomicU32::new(0);
        let result = retry_with_predicate(
            self.policy.clone(),
            || {
                if attempts.fetch_add(1, Ordering::Relaxed) > 0 {
                    PublisherMetrics::record_retry(queue);
                }
                self.attempt(queue, Some(message.clone()))
            },
            AttemptError::is_retryable,
        )
        .await;

        match result {
            Ok(()) => {
                PublisherMetrics::record_published(queue);
                tracing::debug!(
                    queue,
                    message_id = %envelope.message_id,
                    order_id = %envelope.event.order_id(),
                    "Message published"
                );
                Ok(())
            },
            Err(AttemptError::Topology(e)) if !e.is_connection_level() => {
                Err(PublishError::Topology(e))
            },
            Err(e) => {
                PublisherMetrics::record_failure(queue);
                let attempts = attempts.load(Ordering::Relaxed);
                tracing::error!(
                    queue,
                    message_id = %envelope.message_id,
                    attempts,
                    error = %e,
                    "Publish retries exhausted"
                );
                Err(PublishError::Unavailable {
                    queue: queue.to_string(),
                    attempts,
                    reason: e.to_string(),
                })
            },
        }
    }

    /// Declare `queue` and its dead-letter queue without publishing.
    ///
    /// Lets a service fail at startup on an incompatible queue instead of on
    /// its first publish.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Topology`] if the queue exists with incompatible properties
    /// - [`PublishError::Unavailable`] once the retry budget is exhausted
    /// - [`PublishError::Closed`] after [`Publisher::close`]
    pub async fn declare(&self, queue: &str) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }

        let attempts = AtomicU32::new(0);
        let result = retry_with_predicate(
            self.policy.clone(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.attempt(queue, None)
            },
            AttemptError::is_retryable,
        )
        .await;

        match result {
            Ok(()) => {
                tracing::info!(queue, "Output queue declared");
                Ok(())
            },
            Err(AttemptError::Topology(e)) if !e.is_connection_level() => {
                Err(PublishError::Topology(e))
            },
            Err(e) => Err(PublishError::Unavailable {
                queue: queue.to_string(),
                attempts: attempts.load(Ordering::Relaxed),
                reason: e.to_string(),
            }),
        }
    }

    async fn attempt(
        &self,
        queue: &str,
        message: Option<OutboundMessage>,
    ) -> Result<(), AttemptError> {
        let mut guard = self.session.lock().await;

        if guard.is_none() {
            let channel = self.broker.connect().await.map_err(AttemptError::Broker)?;
            *guard = Some(Session {
                channel,
                declared: HashSet::new(),
            });
        }
        let Some(session) = guard.as_mut() else {
            return Err(AttemptError::Broker(BrokerError::ConnectionLost(
                "publisher session missing".to_string(),
            )));
        };

        let outcome = async {
            if !session.declared.contains(queue) {
                self.topology
                    .ensure_with_dead_letter(session.channel.as_ref(), queue)
                    .await
                    .map_err(AttemptError::Topology)?;
                session.declared.insert(queue.to_string());
            }
            match message {
                Some(message) => session
                    .channel
                    .publish(queue, message)
                    .await
                    .map_err(AttemptError::Broker),
                None => Ok(()),
            }
        }
        .await;

        if outcome.is_err() {
            if let Some(broken) = guard.take() {
                if let Err(e) = broken.channel.close().await {
                    tracing::debug!(error = %e, "Closing failed publisher channel");
                }
            }
        }
        outcome
    }

    /// Release the channel. Further publishes fail with [`PublishError::Closed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.channel.close().await {
                tracing::warn!(error = %e, "Error closing publisher channel");
            } else {
                tracing::info!("Publisher channel closed");
            }
        }
    }
}
