//! Error types for the sync engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Submission and lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task {id} is already queued or running")]
    DuplicateTask { id: String },

    #[error("Queue {priority} is full ({limit} tasks pending)")]
    QueueFull { priority: String, limit: usize },

    #[error("Engine is not accepting new tasks")]
    NotAccepting,

    #[error("Engine already started")]
    AlreadyStarted,
}

/// Failure of a single task attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskError {
    #[error("Task execution failed: {0}")]
    Execution(String),

    #[error("Task timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Convenience constructor for executor implementations.
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution(reason.into())
    }
}

/// Shared-state errors, including optimistic-concurrency rejections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Unknown state category: {0}")]
    UnknownCategory(String),

    #[error("State category {0} is locked for updates")]
    Locked(String),

    #[error("State category {0} is already locked")]
    AlreadyLocked(String),

    #[error("State version mismatch in {category}: expected {expected}, actual {actual}")]
    VersionMismatch {
        category: String,
        expected: u64,
        actual: u64,
    },

    #[error("Subscription {id} not found in {category}")]
    UnknownSubscription { category: String, id: String },
}

/// Resource ledger errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResourceError {
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    #[error("Invalid amount for {resource}: {amount}")]
    InvalidAmount { resource: String, amount: f64 },

    #[error("Not enough {resource} available: requested {requested}, available {available}")]
    Insufficient {
        resource: String,
        requested: f64,
        available: f64,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
