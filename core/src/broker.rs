//! Queue broker abstraction.
//!
//! A [`Broker`] hands out [`BrokerChannel`]s. A channel declares queues,
//! publishes with confirmation, opens a consumer with a prefetch limit, and
//! settles deliveries by acknowledging or rejecting them.
//!
//! # Delivery contract
//!
//! - Every published message is persistent and confirmed by the broker before
//!   [`BrokerChannel::publish`] resolves.
//! - Consumption is manual-ack: a delivery stays unacknowledged until the
//!   consumer calls [`BrokerChannel::ack`] or [`BrokerChannel::reject`].
//! - If the channel or connection closes while deliveries are outstanding, the
//!   broker redelivers them (with `redelivered = true`) to some consumer.
//!
//! # Implementations
//!
//! - `AmqpBroker` (crate `order-pipeline-amqp`) - RabbitMQ via AMQP 0-9-1
//! - `InMemoryBroker` (crate `order-pipeline-testing`) - deterministic, for tests
//!
//! # Dyn Compatibility
//!
//! Methods return [`BrokerFuture`] (a pinned boxed future) rather than using
//! `async fn`, so the runtime can hold `Arc<dyn Broker>` and
//! `Box<dyn BrokerChannel>`.

use futures::Stream;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Content type of every message body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors raised by broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The connection or channel was closed underneath an operation.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The broker could not be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// A queue already exists with incompatible properties.
    #[error("Queue '{queue}' exists with different properties: {reason}")]
    PreconditionFailed {
        /// Queue name
        queue: String,
        /// Broker-provided detail
        reason: String,
    },

    /// The broker negatively acknowledged a publish.
    #[error("Publish to '{0}' was not confirmed by the broker")]
    PublishNacked(String),

    /// The broker returned a mandatory publish: no queue is bound to the routing key.
    #[error("Publish to '{0}' was returned: no such queue")]
    Unroutable(String),

    /// Any other broker failure.
    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether the failure invalidates the channel and requires reconnecting.
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Unavailable(_))
    }
}

/// Declaration of a named queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survives broker restarts
    pub durable: bool,
    /// Restricted to the declaring connection
    pub exclusive: bool,
    /// Deleted when the last consumer leaves
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A durable, shared, non-auto-deleting queue: the shape every pipeline queue uses.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// A message ready to be published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Broker-level message id (mirrors the envelope `message_id`)
    pub message_id: Uuid,
    /// Encoded body
    pub body: Vec<u8>,
    /// Persisted to disk by the broker
    pub persistent: bool,
    /// MIME type of the body
    pub content_type: String,
    /// Application headers
    pub headers: BTreeMap<String, String>,
}

impl OutboundMessage {
    /// A persistent JSON message.
    #[must_use]
    pub fn json(message_id: Uuid, body: Vec<u8>) -> Self {
        Self {
            message_id,
            body,
            persistent: true,
            content_type: JSON_CONTENT_TYPE.to_string(),
            headers: BTreeMap::new(),
        }
    }

    /// Attach an application header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Channel-scoped identifier of a delivery, used to settle it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Tag to settle this delivery with
    pub tag: DeliveryTag,
    /// Raw body
    pub body: Vec<u8>,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    /// Broker-maintained delivery count, when the broker exposes one
    pub delivery_count: Option<u32>,
    /// Broker-level message id, if the publisher set one
    pub message_id: Option<String>,
    /// Application headers
    pub headers: BTreeMap<String, String>,
}

/// Future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of deliveries from a consumer.
///
/// Ends when the channel closes. A connection failure surfaces as an
/// `Err` item followed by the end of the stream.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// A connection factory.
pub trait Broker: Send + Sync {
    /// Open a new connection and a channel on it.
    ///
    /// Publisher confirms are enabled on the returned channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unavailable`] if the broker cannot be reached.
    fn connect(&self) -> BrokerFuture<'_, Box<dyn BrokerChannel>>;
}

/// A channel on an open connection.
///
/// A channel is not safe to drive from several tasks at once for consume and
/// settle. The consumer loop owns its channel exclusively.
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue, idempotently.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PreconditionFailed`] if the queue exists with
    /// different properties, or a connection-level error.
    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BrokerFuture<'a, ()>;

    /// Publish to the default exchange with `queue` as routing key and wait
    /// for the broker's confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishNacked`] if the broker refuses the
    /// message, [`BrokerError::Unroutable`] if `queue` does not exist, or a
    /// connection-level error.
    fn publish<'a>(&'a self, queue: &'a str, message: OutboundMessage) -> BrokerFuture<'a, ()>;

    /// Start consuming `queue` in manual-ack mode with at most `prefetch`
    /// unacknowledged deliveries in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot be registered.
    fn consume<'a>(&'a self, queue: &'a str, prefetch: u16) -> BrokerFuture<'a, DeliveryStream>;

    /// Acknowledge a delivery; the broker forgets it.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is gone (the delivery will be redelivered).
    fn ack(&self, tag: DeliveryTag) -> BrokerFuture<'_, ()>;

    /// Reject a delivery, optionally returning it to its queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is gone.
    fn reject(&self, tag: DeliveryTag, requeue: bool) -> BrokerFuture<'_, ()>;

    /// Close the channel and its connection. Outstanding deliveries are
    /// returned to their queues by the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails.
    fn close(&self) -> BrokerFuture<'_, ()>;
}
