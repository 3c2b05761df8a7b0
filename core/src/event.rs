//! Domain events and the envelope that carries them across the broker.
//!
//! Events are serialized as UTF-8 JSON. Every published message is wrapped in an
//! [`Envelope`] that adds a unique `message_id` (deduplication, redelivery
//! tracking), a `schema_version` (forward compatibility) and an optional
//! `causation_id` linking an emitted event to the message whose handling
//! produced it.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "message_id": "0f8fad5b-d9cb-469f-a165-70867728950e",
//!   "schema_version": 1,
//!   "occurred_at": "2025-01-01T00:00:00Z",
//!   "causation_id": null,
//!   "event": {
//!     "type": "order_created",
//!     "data": { "id": 1, "product": "Widget", "quantity": 2, "price": 9.99,
//!               "created_at": "2025-01-01T00:00:00Z" }
//!   }
//! }
//! ```
//!
//! # Legacy bodies
//!
//! Producers that predate the envelope publish the bare payload (the order row,
//! or `{order_id, status, notified_at}`). [`Envelope::decode`] accepts those on
//! the queue they belong to as `schema_version` 0, deriving a deterministic
//! `message_id` from the body so redeliveries of the same bytes share an id.
//!
//! # Example
//!
//! ```
//! use order_pipeline_core::event::{DomainEvent, Envelope};
//! use order_pipeline_core::domain::{OrderId, PaymentCompleted, PaymentStatus};
//! use chrono::Utc;
//!
//! let event = DomainEvent::PaymentCompleted(PaymentCompleted {
//!     order_id: OrderId::new(7),
//!     status: PaymentStatus::Paid,
//!     notified_at: Utc::now(),
//! });
//! let envelope = Envelope::new(event, Utc::now());
//!
//! let bytes = envelope.to_bytes().unwrap();
//! let decoded = Envelope::decode("payment_completed", &bytes).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

use crate::domain::{Order, OrderId, OrderRequest, PaymentCompleted, PaymentStatus};
use crate::{ORDER_CREATED_QUEUE, PAYMENT_COMPLETED_QUEUE};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Highest envelope schema version this build understands.
pub const SCHEMA_VERSION: u16 = 1;

/// Schema version assigned to bare (pre-envelope) payloads.
pub const LEGACY_SCHEMA_VERSION: u16 = 0;

/// Failure to turn a message body into an [`Envelope`].
///
/// Terminal for the message: retrying an unparseable body cannot succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Body is not valid JSON or does not match the envelope / legacy shape.
    #[error("Malformed message body: {0}")]
    Malformed(String),

    /// Envelope was written by a newer producer.
    #[error("Unsupported schema version {found} (supported up to {supported})")]
    UnsupportedVersion {
        /// Version found in the body
        found: u16,
        /// Highest supported version
        supported: u16,
    },

    /// Bare payload on a queue with no legacy format.
    #[error("Bare payload on queue '{0}' has no legacy format")]
    UnknownLegacyQueue(String),
}

/// Failure to serialize an [`Envelope`].
#[derive(Error, Debug)]
#[error("Failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// The events flowing through the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    /// An order was persisted by the order service.
    OrderCreated(Order),
    /// The payment stage settled an order.
    PaymentCompleted(PaymentCompleted),
}

impl DomainEvent {
    /// Stable event type name; equal to the queue the event travels on.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::OrderCreated(_) => ORDER_CREATED_QUEUE,
            Self::PaymentCompleted(_) => PAYMENT_COMPLETED_QUEUE,
        }
    }

    /// Queue this event is published to.
    #[must_use]
    pub const fn queue_name(&self) -> &'static str {
        self.event_type()
    }

    /// Order the event concerns; used for idempotency and worker routing.
    #[must_use]
    pub const fn order_id(&self) -> OrderId {
        match self {
            Self::OrderCreated(order) => order.id,
            Self::PaymentCompleted(completed) => completed.order_id,
        }
    }
}

impl TryFrom<DomainEvent> for Order {
    type Error = DomainEvent;

    fn try_from(event: DomainEvent) -> Result<Self, Self::Error> {
        match event {
            DomainEvent::OrderCreated(order) => Ok(order),
            other @ DomainEvent::PaymentCompleted(_) => Err(other),
        }
    }
}

impl TryFrom<DomainEvent> for PaymentCompleted {
    type Error = DomainEvent;

    fn try_from(event: DomainEvent) -> Result<Self, Self::Error> {
        match event {
            DomainEvent::PaymentCompleted(completed) => Ok(completed),
            other @ DomainEvent::OrderCreated(_) => Err(other),
        }
    }
}

/// Versioned wrapper around a [`DomainEvent`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per publish
    pub message_id: Uuid,
    /// Envelope schema version
    pub schema_version: u16,
    /// When the event was produced
    pub occurred_at: DateTime<Utc>,
    /// `message_id` of the message whose handling emitted this one
    #[serde(default)]
    pub causation_id: Option<Uuid>,
    /// The wrapped event
    pub event: DomainEvent,
}

impl Envelope {
    /// Wrap an event with a fresh message id.
    #[must_use]
    pub fn new(event: DomainEvent, occurred_at: DateTime<Utc>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            occurred_at,
            causation_id: None,
            event,
        }
    }

    /// Record the message that caused this one.
    #[must_use]
    pub const fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message body received on `queue`.
    ///
    /// Bodies carrying `message_id` or `event` keys are parsed strictly as
    /// envelopes. Anything else is tried as the legacy bare payload of the
    /// queue's event type.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the body is neither a supported envelope
    /// nor a legacy payload for `queue`.
    pub fn decode(queue: &str, body: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let looks_enveloped = value
            .as_object()
            .is_some_and(|obj| obj.contains_key("message_id") || obj.contains_key("event"));

        if looks_enveloped {
            let envelope: Self = serde_json::from_value(value)
                .map_err(|e| DecodeError::Malformed(e.to_string()))?;
            if envelope.schema_version > SCHEMA_VERSION {
                return Err(DecodeError::UnsupportedVersion {
                    found: envelope.schema_version,
                    supported: SCHEMA_VERSION,
                });
            }
            return Ok(envelope);
        }

        let (event, occurred_at) = match queue {
            ORDER_CREATED_QUEUE => legacy_order_created(value)?,
            PAYMENT_COMPLETED_QUEUE => legacy_payment_completed(value)?,
            other => return Err(DecodeError::UnknownLegacyQueue(other.to_string())),
        };

        Ok(Self {
            message_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, body),
            schema_version: LEGACY_SCHEMA_VERSION,
            occurred_at,
            causation_id: None,
            event,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ type: {}, message_id: {}, order_id: {} }}",
            self.event.event_type(),
            self.message_id,
            self.event.order_id()
        )
    }
}

#[derive(Deserialize)]
struct LegacyOrder {
    id: i64,
    product: serde_json::Value,
    quantity: serde_json::Value,
    price: serde_json::Value,
    created_at: String,
}

#[derive(Deserialize)]
struct LegacyPaymentCompleted {
    order_id: i64,
    status: String,
    notified_at: String,
}

fn legacy_order_created(
    value: serde_json::Value,
) -> Result<(DomainEvent, DateTime<Utc>), DecodeError> {
    let legacy: LegacyOrder =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let fields = OrderRequest {
        product: Some(legacy.product),
        quantity: Some(legacy.quantity),
        price: Some(legacy.price),
    }
    .validate()
    .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let created_at = parse_legacy_timestamp(&legacy.created_at).ok_or_else(|| {
        DecodeError::Malformed(format!("Invalid created_at '{}'", legacy.created_at))
    })?;

    let order = Order {
        id: OrderId::new(legacy.id),
        product: fields.product,
        quantity: fields.quantity,
        price: fields.price,
        created_at,
    };
    Ok((DomainEvent::OrderCreated(order), created_at))
}

fn legacy_payment_completed(
    value: serde_json::Value,
) -> Result<(DomainEvent, DateTime<Utc>), DecodeError> {
    let legacy: LegacyPaymentCompleted =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let status =
        PaymentStatus::parse(&legacy.status).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let notified_at = parse_legacy_timestamp(&legacy.notified_at).ok_or_else(|| {
        DecodeError::Malformed(format!("Invalid notified_at '{}'", legacy.notified_at))
    })?;

    let completed = PaymentCompleted {
        order_id: OrderId::new(legacy.order_id),
        status,
        notified_at,
    };
    Ok((DomainEvent::PaymentCompleted(completed), notified_at))
}

/// RFC 3339, or `YYYY-MM-DD HH:MM:SS` interpreted as UTC.
fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
