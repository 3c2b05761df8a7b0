//! Per-service persistence boundary.
//!
//! Each service owns one [`RecordStore`] and is authoritative only for its own
//! record type. The pipeline needs exactly two operations from it: create a
//! record, and look one up by the order it belongs to.
//!
//! Payment and payment-log stores enforce at most one record per `order_id`.
//! A create that loses a race against a concurrent duplicate fails with
//! [`StoreError::Conflict`]; [`find_or_create`] turns that into "already exists".

use crate::domain::{OrderId, ValidationError};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from record store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached; retrying later may succeed.
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the record's fields.
    #[error("Record rejected: {0}")]
    Validation(#[from] ValidationError),

    /// A record for this order already exists.
    #[error("Record for order {order_id} already exists")]
    Conflict {
        /// Order the existing record belongs to
        order_id: OrderId,
    },
}

impl StoreError {
    /// Whether the failure is worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Future returned by record store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Create/find persistence for one record type.
pub trait RecordStore: Send + Sync {
    /// Fields needed to create a record.
    type Fields: Send + 'static;
    /// The persisted record.
    type Record: Send + 'static;

    /// Persist a new record.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unavailable`] if the store cannot be reached
    /// - [`StoreError::Validation`] if the fields are rejected
    /// - [`StoreError::Conflict`] if the store is unique by `order_id` and a record exists
    fn create(&self, fields: Self::Fields) -> StoreFuture<'_, Self::Record>;

    /// Look up the record belonging to `order_id`. For the order store this
    /// is the order itself.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be reached.
    fn find_by_order_id(&self, order_id: OrderId) -> StoreFuture<'_, Option<Self::Record>>;
}

/// Whether [`find_or_create`] wrote a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    /// A new record was written
    New,
    /// A record for the order already existed
    Existing,
}

/// Return the record for `order_id`, creating it from `fields` if absent.
///
/// A [`StoreError::Conflict`] from the create (a concurrent duplicate won the
/// race) is resolved by reading the winner back.
///
/// # Errors
///
/// Propagates [`StoreError::Unavailable`] and [`StoreError::Validation`]. A
/// conflict whose winner cannot be read back is reported as `Unavailable`.
pub async fn find_or_create<S>(
    store: &S,
    order_id: OrderId,
    fields: S::Fields,
) -> Result<(S::Record, Created), StoreError>
where
    S: RecordStore + ?Sized,
{
    if let Some(existing) = store.find_by_order_id(order_id).await? {
        return Ok((existing, Created::Existing));
    }

    match store.create(fields).await {
        Ok(record) => Ok((record, Created::New)),
        Err(StoreError::Conflict { .. }) => store
            .find_by_order_id(order_id)
            .await?
            .map(|record| (record, Created::Existing))
            .ok_or_else(|| {
                StoreError::Unavailable(format!(
                    "record for order {order_id} conflicted but could not be read back"
                ))
            }),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Store whose first lookup misses even though a record exists,
    /// simulating a concurrent writer winning between lookup and create.
    struct RacingStore {
        lookups: Mutex<u32>,
    }

    impl RecordStore for RacingStore {
        type Fields = i64;
        type Record = i64;

        fn create(&self, _fields: i64) -> StoreFuture<'_, i64> {
            Box::pin(async { Err(StoreError::Conflict { order_id: OrderId::new(1) }) })
        }

        fn find_by_order_id(&self, _order_id: OrderId) -> StoreFuture<'_, Option<i64>> {
            let mut lookups = self.lookups.lock().unwrap();
            *lookups += 1;
            let found = (*lookups > 1).then_some(99);
            Box::pin(async move { Ok(found) })
        }
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::Conflict { order_id: OrderId::new(1) }.is_transient());
        assert!(
            !StoreError::Validation(ValidationError::Missing { field: "product" }).is_transient()
        );
    }

    #[test]
    fn conflict_resolves_to_existing_record() {
        let store = RacingStore {
            lookups: Mutex::new(0),
        };
        let (record, created) =
            futures::executor::block_on(find_or_create(&store, OrderId::new(1), 7)).unwrap();
        assert_eq!(record, 99);
        assert_eq!(created, Created::Existing);
    }
}
