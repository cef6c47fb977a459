//! A single state category.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a state subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Notification delivered to subscribers after a successful update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub category: String,
    pub key: String,
    pub value: serde_json::Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Whole-category read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySnapshot {
    pub values: HashMap<String, serde_json::Value>,
    pub version: u64,
}

/// Single-key read. `value` is `None` when the key was never set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyedValue {
    pub value: Option<serde_json::Value>,
    pub version: u64,
}

/// Subscriber callback. Returned errors and panics are logged and swallowed.
pub type StateCallback = Arc<dyn Fn(&StateChange) -> anyhow::Result<()> + Send + Sync>;

pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub key: Option<String>,
    pub callback: StateCallback,
}

impl Subscription {
    fn matches(&self, key: &str) -> bool {
        self.key.as_deref().is_none_or(|k| k == key)
    }
}

pub(crate) struct Category {
    pub name: String,
    pub data: HashMap<String, serde_json::Value>,
    pub version: u64,
    pub locked: bool,
    pub last_updated: DateTime<Utc>,
    pub subscriptions: Vec<Subscription>,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: HashMap::new(),
            version: 1,
            locked: false,
            last_updated: Utc::now(),
            subscriptions: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> CategorySnapshot {
        CategorySnapshot {
            values: self.data.clone(),
            version: self.version,
        }
    }

    /// Write `key`, bump the version and return the change to publish.
    pub fn apply(&mut self, key: &str, value: serde_json::Value) -> StateChange {
        self.data.insert(key.to_string(), value.clone());
        self.version += 1;
        self.last_updated = Utc::now();
        StateChange {
            category: self.name.clone(),
            key: key.to_string(),
            value,
            version: self.version,
            timestamp: self.last_updated,
        }
    }

    /// Deliver `change` to every matching subscriber. Returns how many were notified.
    pub fn notify(&self, change: &StateChange) -> usize {
        let mut notified = 0;
        for sub in self.subscriptions.iter().filter(|s| s.matches(&change.key)) {
            notified += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| (sub.callback)(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        category = %change.category,
                        subscription = %sub.id,
                        "State subscriber failed: {}",
                        e
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        category = %change.category,
                        subscription = %sub.id,
                        "State subscriber panicked"
                    );
                }
            }
        }
        notified
    }
}
