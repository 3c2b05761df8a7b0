//! # Order Pipeline Testing
//!
//! Test doubles for the order pipeline.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a queue broker with AMQP delivery semantics and fault injection
//! - [`InMemoryStore`]: record stores for orders, payments and payment logs
//! - [`FixedClock`]: deterministic time
//! - [`helpers::eventually`]: polling assertion for asynchronous outcomes
//!
//! ## Example
//!
//! ```ignore
//! use order_pipeline_testing::{InMemoryBroker, InMemoryPaymentStore};
//!
//! #[tokio::test]
//! async fn payment_is_recorded_once() {
//!     let broker = InMemoryBroker::new();
//!     let payments = InMemoryPaymentStore::new();
//!     // run the payment stage against `broker`, publish the same order twice...
//!     assert_eq!(payments.len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use order_pipeline_core::environment::Clock;

pub mod broker;
pub mod store;

pub use broker::{InMemoryBroker, InMemoryChannel};
pub use store::{
    InMemoryOrderStore, InMemoryPaymentLogStore, InMemoryPaymentStore, InMemoryRecord,
    InMemoryStore,
};

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use order_pipeline_testing::mocks::FixedClock;
    /// use order_pipeline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use std::time::Duration;

    /// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition became true.
    pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// Re-export commonly used items
pub use helpers::eventually;
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[tokio::test]
    async fn eventually_gives_up() {
        assert!(!eventually(Duration::from_millis(20), || false).await);
        let mut calls = 0;
        assert!(
            eventually(Duration::from_secs(1), || {
                calls += 1;
                calls > 2
            })
            .await
        );
    }
}
