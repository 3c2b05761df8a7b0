//! Dead-letter records.
//!
//! A message the consumer gives up on is wrapped in a [`DeadLetter`] and
//! published to the source queue's dead-letter queue, so operators can inspect
//! and replay it. The original body is kept verbatim (lossy UTF-8 for
//! non-text bodies).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unknown reason string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid dead-letter reason: {0}")]
pub struct InvalidReason(String);

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The body could not be decoded into an envelope
    DecodeFailed,
    /// The handler reported a permanent failure
    Rejected,
    /// Transient failures exceeded the redelivery limit
    RedeliveryExhausted,
}

impl DeadLetterReason {
    /// Wire and metric label representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DecodeFailed => "decode_failed",
            Self::Rejected => "rejected",
            Self::RedeliveryExhausted => "redelivery_exhausted",
        }
    }

    /// Parse the wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidReason`] if the string doesn't match a known reason.
    pub fn parse(s: &str) -> Result<Self, InvalidReason> {
        match s {
            "decode_failed" => Ok(Self::DecodeFailed),
            "rejected" => Ok(Self::Rejected),
            "redelivery_exhausted" => Ok(Self::RedeliveryExhausted),
            other => Err(InvalidReason(other.to_string())),
        }
    }
}

/// A message routed to a dead-letter queue, plus failure metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Queue the message was consumed from
    pub source_queue: String,
    /// Envelope message id, if the body decoded far enough to have one
    pub message_id: Option<Uuid>,
    /// Failure category
    pub reason: DeadLetterReason,
    /// Error text from the last failure
    pub detail: String,
    /// Delivery attempts made
    pub attempts: u32,
    /// When the consumer gave up
    pub failed_at: DateTime<Utc>,
    /// Original message body
    pub body: String,
}

impl DeadLetter {
    /// Build a record for `body` consumed from `source_queue`.
    #[must_use]
    pub fn new(
        source_queue: impl Into<String>,
        reason: DeadLetterReason,
        detail: impl Into<String>,
        body: &[u8],
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_queue: source_queue.into(),
            message_id: None,
            reason,
            detail: detail.into(),
            attempts: 1,
            failed_at,
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }

    /// Set the envelope message id.
    #[must_use]
    pub const fn with_message_id(mut self, message_id: Option<Uuid>) -> Self {
        self.message_id = message_id;
        self
    }

    /// Set the number of attempts.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns a serialization error (not expected for this type).
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
