//! Sync Engine — prioritized task scheduling with shared-state coordination.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod resources;
pub mod scheduler;
pub mod shared;

pub use engine::Engine;
pub use error::{Error, Result};
