//! Shared state — versioned categories with optimistic concurrency and pub/sub.
//!
//! - `category` — a single partition: data, version counter, lock flag, subscriptions
//! - `store` — the fixed set of categories, one lock per category

pub mod category;
pub mod store;

pub use category::{CategorySnapshot, KeyedValue, StateCallback, StateChange, SubscriptionId};
pub use store::StateStore;
