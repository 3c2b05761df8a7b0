//! Domain records exchanged by the pipeline.
//!
//! Each service is authoritative for exactly one record type:
//!
//! | Record        | Owner                | Created from                 |
//! |---------------|----------------------|------------------------------|
//! | [`Order`]     | order service        | `POST /api/orders`           |
//! | [`Payment`]   | payment service      | `order_created` envelope     |
//! | [`PaymentLog`]| notification service | `payment_completed` envelope |
//!
//! `order_id` on `Payment` and `PaymentLog` is a lookup key only. Services do not
//! share storage, so nothing enforces the reference across service boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of an [`Order`], assigned by the order service's record store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(i64);

impl OrderId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw identifier value.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rejection of malformed business input.
///
/// Raised at the boundary (HTTP intake) or when an incoming event carries a
/// payload that can never be applied. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is absent or empty.
    #[error("The {field} field is required.")]
    Missing {
        /// Field name
        field: &'static str,
    },

    /// A field is present but does not satisfy its rule.
    #[error("The {field} field {reason}.")]
    Invalid {
        /// Field name
        field: &'static str,
        /// Human-readable rule that failed
        reason: String,
    },
}

impl ValidationError {
    /// Name of the offending field.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::Missing { field } | Self::Invalid { field, .. } => field,
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Raw order request as received over HTTP.
///
/// Fields are kept as loose JSON values so type mismatches surface as
/// [`ValidationError`]s with field names rather than as body parse failures.
/// Numeric strings (`"2"`, `"9.99"`) are accepted like numbers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Product name
    #[serde(default)]
    pub product: Option<serde_json::Value>,
    /// Quantity (integer ≥ 1)
    #[serde(default)]
    pub quantity: Option<serde_json::Value>,
    /// Unit price (numeric ≥ 0)
    #[serde(default)]
    pub price: Option<serde_json::Value>,
}

impl OrderRequest {
    /// Build a request from already-typed values.
    #[must_use]
    pub fn new(product: impl Into<String>, quantity: i64, price: f64) -> Self {
        Self {
            product: Some(serde_json::Value::String(product.into())),
            quantity: Some(serde_json::Value::from(quantity)),
            price: Some(serde_json::Value::from(price)),
        }
    }

    /// Validate the request into a [`NewOrder`].
    ///
    /// Rules: `product` is a non-empty string, `quantity` an integer ≥ 1,
    /// `price` a finite number ≥ 0. The first failing field is reported.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] naming the first field that fails.
    pub fn validate(&self) -> Result<NewOrder, ValidationError> {
        let product = match &self.product {
            None | Some(serde_json::Value::Null) => {
                return Err(ValidationError::Missing { field: "product" });
            },
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
                return Err(ValidationError::Missing { field: "product" });
            },
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(_) => return Err(ValidationError::invalid("product", "must be a string")),
        };

        let quantity = match &self.quantity {
            None | Some(serde_json::Value::Null) => {
                return Err(ValidationError::Missing { field: "quantity" });
            },
            Some(value) => integer_value(value)
                .ok_or_else(|| ValidationError::invalid("quantity", "must be an integer"))?,
        };
        if quantity < 1 {
            return Err(ValidationError::invalid("quantity", "must be at least 1"));
        }
        let quantity = u32::try_from(quantity)
            .map_err(|_| ValidationError::invalid("quantity", "is too large"))?;

        let price = match &self.price {
            None | Some(serde_json::Value::Null) => {
                return Err(ValidationError::Missing { field: "price" });
            },
            Some(value) => numeric_value(value)
                .ok_or_else(|| ValidationError::invalid("price", "must be a number"))?,
        };
        if price < 0.0 {
            return Err(ValidationError::invalid("price", "must be at least 0"));
        }

        Ok(NewOrder {
            product,
            quantity,
            price,
        })
    }
}

fn integer_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numeric_value(value: &serde_json::Value) -> Option<f64> {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

/// A validated order, ready to be persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    /// Product name (non-empty)
    pub product: String,
    /// Quantity (≥ 1)
    pub quantity: u32,
    /// Unit price (≥ 0)
    pub price: f64,
}

/// A persisted order. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Identifier assigned by the record store
    pub id: OrderId,
    /// Product name
    pub product: String,
    /// Quantity
    pub quantity: u32,
    /// Unit price
    pub price: f64,
    /// When the order was persisted
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Check that an order snapshot received from the broker can be processed.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the id is not positive or the snapshot
    /// violates the intake rules.
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.id.value() <= 0 {
            return Err(ValidationError::invalid("id", "must be a positive integer"));
        }
        if self.product.trim().is_empty() {
            return Err(ValidationError::Missing { field: "product" });
        }
        if self.quantity < 1 {
            return Err(ValidationError::invalid("quantity", "must be at least 1"));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(ValidationError::invalid("price", "must be at least 0"));
        }
        Ok(())
    }
}

/// Status of a payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Payment captured
    Paid,
    /// Payment declined
    Failed,
    /// Payment awaiting settlement
    Pending,
}

impl PaymentStatus {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }

    /// Parse the wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for unknown status strings.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            "pending" => Ok(Self::Pending),
            other => Err(ValidationError::invalid(
                "status",
                format!("has unknown value '{other}'"),
            )),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields for creating a [`Payment`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPayment {
    /// Order this payment settles
    pub order_id: OrderId,
    /// Initial status
    pub status: PaymentStatus,
}

/// A persisted payment. At most one exists per `order_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Identifier assigned by the record store
    pub id: i64,
    /// Order this payment settles
    pub order_id: OrderId,
    /// Payment status
    pub status: PaymentStatus,
}

/// Fields for creating a [`PaymentLog`]; also the `payment_completed` event body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    /// Order the payment belongs to
    pub order_id: OrderId,
    /// Payment status
    pub status: PaymentStatus,
    /// When the payment stage reported completion
    pub notified_at: DateTime<Utc>,
}

impl PaymentCompleted {
    /// Check that a completion event can be recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `order_id` is not positive.
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.order_id.value() <= 0 {
            return Err(ValidationError::invalid(
                "order_id",
                "must be a positive integer",
            ));
        }
        Ok(())
    }
}

/// Append-only audit record of a completed payment. At most one per `order_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLog {
    /// Order the payment belongs to
    pub order_id: OrderId,
    /// Payment status at notification time
    pub status: PaymentStatus,
    /// Timestamp carried by the `payment_completed` event
    pub notified_at: DateTime<Utc>,
}
