//! Versioned state store.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StateError;
use crate::shared::category::{
    Category, CategorySnapshot, KeyedValue, StateCallback, Subscription, SubscriptionId,
};

/// Categorized key/value state with per-category versioning, locking and subscriptions.
///
/// The category set is fixed at construction; each category sits behind its
/// own lock so the version check, write and notification of one update form a
/// single critical section without serializing unrelated categories.
pub struct StateStore {
    categories: BTreeMap<String, RwLock<Category>>,
}

impl StateStore {
    /// Create a store with the given categories, each at version 1.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let categories = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                (name.clone(), RwLock::new(Category::new(name)))
            })
            .collect();
        Self { categories }
    }

    fn category(&self, name: &str) -> Result<&RwLock<Category>, StateError> {
        self.categories.get(name).ok_or_else(|| {
            warn!(category = %name, "Invalid state category");
            StateError::UnknownCategory(name.to_string())
        })
    }

    /// Names of all categories.
    pub fn categories(&self) -> Vec<String> {
        self.categories.keys().cloned().collect()
    }

    /// Read a whole category.
    pub async fn get(&self, category: &str) -> Result<CategorySnapshot, StateError> {
        Ok(self.category(category)?.read().await.snapshot())
    }

    /// Read one key of a category.
    pub async fn get_key(&self, category: &str, key: &str) -> Result<KeyedValue, StateError> {
        let cat = self.category(category)?.read().await;
        Ok(KeyedValue {
            value: cat.data.get(key).cloned(),
            version: cat.version,
        })
    }

    /// Set `key` to `value`, returning the new version.
    ///
    /// Rejected without mutation when the category is locked or when
    /// `expected_version` is given and differs from the current version.
    pub async fn update(
        &self,
        category: &str,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StateError> {
        let mut cat = self.category(category)?.write().await;

        if cat.locked {
            warn!(category = %category, "State category is locked for updates");
            return Err(StateError::Locked(category.to_string()));
        }

        if let Some(expected) = expected_version
            && expected != cat.version
        {
            warn!(
                category = %category,
                expected,
                actual = cat.version,
                "State version mismatch"
            );
            return Err(StateError::VersionMismatch {
                category: category.to_string(),
                expected,
                actual: cat.version,
            });
        }

        let change = cat.apply(key, value);
        let notified = cat.notify(&change);
        debug!(
            category = %category,
            key,
            version = change.version,
            notified,
            "State updated"
        );
        Ok(change.version)
    }

    /// Block further updates to `category`.
    pub async fn lock(&self, category: &str) -> Result<(), StateError> {
        let mut cat = self.category(category)?.write().await;
        if cat.locked {
            warn!(category = %category, "State category is already locked");
            return Err(StateError::AlreadyLocked(category.to_string()));
        }
        cat.locked = true;
        Ok(())
    }

    /// Allow updates to `category` again. Unlocking an unlocked category is a no-op.
    pub async fn unlock(&self, category: &str) -> Result<(), StateError> {
        self.category(category)?.write().await.locked = false;
        Ok(())
    }

    /// Whether `category` is currently locked.
    pub async fn is_locked(&self, category: &str) -> Result<bool, StateError> {
        Ok(self.category(category)?.read().await.locked)
    }

    /// Register `callback` for changes to `key` (or any key when `None`).
    pub async fn subscribe(
        &self,
        category: &str,
        key: Option<&str>,
        callback: StateCallback,
    ) -> Result<SubscriptionId, StateError> {
        let mut cat = self.category(category)?.write().await;
        let id = SubscriptionId::new();
        cat.subscriptions.push(Subscription {
            id,
            key: key.map(str::to_string),
            callback,
        });
        debug!(category = %category, subscription = %id, ?key, "Subscribed to state");
        Ok(id)
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, category: &str, id: SubscriptionId) -> Result<(), StateError> {
        let mut cat = self.category(category)?.write().await;
        let before = cat.subscriptions.len();
        cat.subscriptions.retain(|s| s.id != id);
        if cat.subscriptions.len() == before {
            return Err(StateError::UnknownSubscription {
                category: category.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
