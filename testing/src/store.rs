//! In-memory record stores.
//!
//! One generic [`InMemoryStore`] backs all three record types. Payment and
//! payment-log stores are unique by `order_id` like their `PostgreSQL`
//! counterparts; the order store hands out sequential ids.
//!
//! Fault injection:
//!
//! - [`InMemoryStore::set_unavailable`]: every operation fails until cleared
//! - [`InMemoryStore::fail_next`]: the next `n` operations fail
//! - [`InMemoryStore::fail_after_commit`]: the next `n` creates persist and
//!   then report failure, as if the connection dropped before the reply
//! - [`InMemoryStore::miss_next_lookups`]: lookups miss existing records, so
//!   the following create races into a conflict

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use chrono::{DateTime, Utc};
use order_pipeline_core::domain::{
    NewOrder, NewPayment, Order, OrderId, Payment, PaymentCompleted, PaymentLog,
};
use order_pipeline_core::environment::{Clock, SystemClock};
use order_pipeline_core::record_store::{RecordStore, StoreError, StoreFuture};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// A record type the in-memory store can hold.
pub trait InMemoryRecord: Clone + Send + Sync + 'static {
    /// Fields a create receives.
    type Fields: Send + 'static;

    /// Whether at most one record may exist per order.
    const UNIQUE_BY_ORDER: bool;

    /// Build the record from a freshly assigned id.
    fn build(id: i64, fields: Self::Fields, now: DateTime<Utc>) -> Self;

    /// Order the fields belong to, if known before the record exists.
    fn fields_order_id(fields: &Self::Fields) -> Option<OrderId>;

    /// Order the record belongs to.
    fn order_id(&self) -> OrderId;
}

impl InMemoryRecord for Order {
    type Fields = NewOrder;
    const UNIQUE_BY_ORDER: bool = false;

    fn build(id: i64, fields: NewOrder, now: DateTime<Utc>) -> Self {
        Self {
            id: OrderId::new(id),
            product: fields.product,
            quantity: fields.quantity,
            price: fields.price,
            created_at: now,
        }
    }

    fn fields_order_id(_fields: &NewOrder) -> Option<OrderId> {
        None
    }

    fn order_id(&self) -> OrderId {
        self.id
    }
}

impl InMemoryRecord for Payment {
    type Fields = NewPayment;
    const UNIQUE_BY_ORDER: bool = true;

    fn build(id: i64, fields: NewPayment, _now: DateTime<Utc>) -> Self {
        Self {
            id,
            order_id: fields.order_id,
            status: fields.status,
        }
    }

    fn fields_order_id(fields: &NewPayment) -> Option<OrderId> {
        Some(fields.order_id)
    }

    fn order_id(&self) -> OrderId {
        self.order_id
    }
}

impl InMemoryRecord for PaymentLog {
    type Fields = PaymentCompleted;
    const UNIQUE_BY_ORDER: bool = true;

    fn build(_id: i64, fields: PaymentCompleted, _now: DateTime<Utc>) -> Self {
        Self {
            order_id: fields.order_id,
            status: fields.status,
            notified_at: fields.notified_at,
        }
    }

    fn fields_order_id(fields: &PaymentCompleted) -> Option<OrderId> {
        Some(fields.order_id)
    }

    fn order_id(&self) -> OrderId {
        self.order_id
    }
}

/// In-memory [`RecordStore`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryStore<R> {
    records: Arc<RwLock<Vec<R>>>,
    next_id: Arc<AtomicI64>,
    unavailable: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    fail_after_commit: Arc<AtomicU32>,
    miss_lookups: Arc<AtomicU32>,
    clock: Arc<dyn Clock>,
}

/// In-memory order store.
pub type InMemoryOrderStore = InMemoryStore<Order>;
/// In-memory payment store.
pub type InMemoryPaymentStore = InMemoryStore<Payment>;
/// In-memory payment-log store.
pub type InMemoryPaymentLogStore = InMemoryStore<PaymentLog>;

impl<R> std::fmt::Debug for InMemoryStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("records", &self.records.read().unwrap().len())
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<R: InMemoryRecord> Default for InMemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrement `counter` if positive; report whether it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl<R: InMemoryRecord> InMemoryStore<R> {
    /// Create an empty store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            unavailable: Arc::new(AtomicBool::new(false)),
            fail_next: Arc::new(AtomicU32::new(0)),
            fail_after_commit: Arc::new(AtomicU32::new(0)),
            miss_lookups: Arc::new(AtomicU32::new(0)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp records with `clock` instead of the system time.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make every operation fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` operations with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Let the next `count` creates persist, then report `Unavailable`.
    pub fn fail_after_commit(&self, count: u32) {
        self.fail_after_commit.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` lookups miss.
    pub fn miss_next_lookups(&self, count: u32) {
        self.miss_lookups.store(count, Ordering::SeqCst);
    }

    /// Seed a record directly.
    pub fn insert(&self, record: R) {
        self.records.write().unwrap().push(record);
    }

    /// Snapshot of all records, in creation order.
    #[must_use]
    pub fn all(&self) -> Vec<R> {
        self.records.read().unwrap().clone()
    }

    /// Records belonging to `order_id`.
    #[must_use]
    pub fn for_order(&self, order_id: OrderId) -> Vec<R> {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.order_id() == order_id)
            .cloned()
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) || take_one(&self.fail_next) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn create_now(&self, fields: R::Fields) -> Result<R, StoreError> {
        self.check_available()?;

        let mut records = self.records.write().unwrap();
        if R::UNIQUE_BY_ORDER {
            if let Some(order_id) = R::fields_order_id(&fields) {
                if records.iter().any(|r| r.order_id() == order_id) {
                    return Err(StoreError::Conflict { order_id });
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = R::build(id, fields, self.clock.now());
        records.push(record.clone());
        drop(records);

        if take_one(&self.fail_after_commit) {
            return Err(StoreError::Unavailable(
                "connection reset after commit".to_string(),
            ));
        }
        Ok(record)
    }

    fn find_now(&self, order_id: OrderId) -> Result<Option<R>, StoreError> {
        self.check_available()?;
        if take_one(&self.miss_lookups) {
            return Ok(None);
        }
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .find(|r| r.order_id() == order_id)
            .cloned())
    }
}

impl<R: InMemoryRecord> RecordStore for InMemoryStore<R> {
    type Fields = R::Fields;
    type Record = R;

    fn create(&self, fields: R::Fields) -> StoreFuture<'_, R> {
        let result = self.create_now(fields);
        Box::pin(async move { result })
    }

    fn find_by_order_id(&self, order_id: OrderId) -> StoreFuture<'_, Option<R>> {
        let result = self.find_now(order_id);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_clock;
    use order_pipeline_core::domain::PaymentStatus;
    use order_pipeline_core::record_store::{Created, find_or_create};

    fn new_payment(order_id: i64) -> NewPayment {
        NewPayment {
            order_id: OrderId::new(order_id),
            status: PaymentStatus::Paid,
        }
    }

    #[tokio::test]
    async fn orders_get_sequential_ids_and_clock_time() {
        let clock = test_clock();
        let store = InMemoryOrderStore::new().with_clock(Arc::new(clock.clone()));
        let fields = NewOrder {
            product: "Widget".into(),
            quantity: 2,
            price: 9.99,
        };

        let first = store.create(fields.clone()).await.unwrap();
        let second = store.create(fields).await.unwrap();

        assert_eq!(first.id, OrderId::new(1));
        assert_eq!(second.id, OrderId::new(2));
        assert_eq!(first.created_at, clock.now());
    }

    #[tokio::test]
    async fn payments_are_unique_per_order() {
        let store = InMemoryPaymentStore::new();
        store.create(new_payment(7)).await.unwrap();

        let err = store.create(new_payment(7)).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict { order_id: OrderId::new(7) });
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn commit_then_failure_keeps_record() {
        let store = InMemoryPaymentStore::new();
        store.fail_after_commit(1);

        assert!(store.create(new_payment(3)).await.is_err());
        assert_eq!(store.for_order(OrderId::new(3)).len(), 1);
    }

    #[tokio::test]
    async fn missed_lookup_races_into_existing() {
        let store = InMemoryPaymentStore::new();
        store.create(new_payment(5)).await.unwrap();
        store.miss_next_lookups(1);

        let (_, created) = find_or_create(&store, OrderId::new(5), new_payment(5))
            .await
            .unwrap();
        assert_eq!(created, Created::Existing);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = InMemoryPaymentLogStore::new();
        store.set_unavailable(true);
        assert!(store.find_by_order_id(OrderId::new(1)).await.unwrap_err().is_transient());

        store.set_unavailable(false);
        store.fail_next(1);
        assert!(store.find_by_order_id(OrderId::new(1)).await.is_err());
        assert!(store.find_by_order_id(OrderId::new(1)).await.unwrap().is_none());
    }
}
