//! HTTP request handlers.

pub mod gateway;
pub mod health;
pub mod orders;

pub use gateway::forward_order;
pub use health::health_check;
pub use orders::create_order;
