//! Resource ledger — percentage-of-capacity accounting per named resource.
//!
//! Every entry keeps `available + used + reserved == 100`. Reservations move
//! capacity from `available` to `reserved`; the periodic refresh recomputes
//! `used` from a [`UsageProbe`] and derives `available` from the rest.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ResourceError;

/// Total capacity of every resource, in percent.
pub const CAPACITY: f64 = 100.0;

/// Accounting for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub available: f64,
    pub used: f64,
    pub reserved: f64,
    pub last_updated: DateTime<Utc>,
}

impl ResourceEntry {
    fn new() -> Self {
        Self {
            available: CAPACITY,
            used: 0.0,
            reserved: 0.0,
            last_updated: Utc::now(),
        }
    }

    /// Apply a usage reading, keeping the capacity invariant.
    fn apply_usage(&mut self, used: f64) {
        let used = if used.is_finite() { used } else { self.used };
        self.used = used.clamp(0.0, (CAPACITY - self.reserved).max(0.0));
        self.recompute_available();
    }

    fn recompute_available(&mut self) {
        self.available = (CAPACITY - self.used - self.reserved).max(0.0);
        self.last_updated = Utc::now();
    }
}

/// Source of usage readings for the periodic refresh.
pub trait UsageProbe: Send + Sync {
    /// Return the current usage (percent) of `resource`.
    fn sample(&self, resource: &str, current: &ResourceEntry) -> f64;
}

/// Simulated usage signal: drifts each resource by up to `max_step` per refresh.
#[derive(Debug, Clone)]
pub struct RandomWalkProbe {
    pub max_step: f64,
}

impl Default for RandomWalkProbe {
    fn default() -> Self {
        Self { max_step: 5.0 }
    }
}

impl UsageProbe for RandomWalkProbe {
    fn sample(&self, _resource: &str, current: &ResourceEntry) -> f64 {
        if self.max_step <= 0.0 {
            return current.used;
        }
        let delta = rand::thread_rng().gen_range(-self.max_step..=self.max_step);
        current.used + delta
    }
}

/// Ledger of all tracked resources.
pub struct ResourceLedger {
    entries: RwLock<BTreeMap<String, ResourceEntry>>,
}

impl ResourceLedger {
    /// Create a ledger with every resource fully available.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = names
            .into_iter()
            .map(|name| (name.into(), ResourceEntry::new()))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Reserve `amount` of `resource`. Leaves the ledger untouched on failure.
    pub async fn reserve(&self, resource: &str, amount: f64) -> Result<(), ResourceError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(resource) else {
            warn!(resource, "Unknown resource type");
            return Err(ResourceError::UnknownResource(resource.to_string()));
        };

        if !amount.is_finite() || amount < 0.0 {
            warn!(resource, amount, "Invalid reservation amount");
            return Err(ResourceError::InvalidAmount {
                resource: resource.to_string(),
                amount,
            });
        }

        if amount > entry.available {
            warn!(
                resource,
                requested = amount,
                available = entry.available,
                "Not enough capacity to reserve"
            );
            return Err(ResourceError::Insufficient {
                resource: resource.to_string(),
                requested: amount,
                available: entry.available,
            });
        }

        entry.reserved += amount;
        entry.recompute_available();
        debug!(resource, amount, reserved = entry.reserved, "Reserved capacity");
        Ok(())
    }

    /// Return `amount` of reserved capacity. Reserved is floored at zero.
    pub async fn release(&self, resource: &str, amount: f64) -> Result<(), ResourceError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(resource) else {
            warn!(resource, "Unknown resource type");
            return Err(ResourceError::UnknownResource(resource.to_string()));
        };

        if !amount.is_finite() || amount < 0.0 {
            warn!(resource, amount, "Invalid release amount");
            return Err(ResourceError::InvalidAmount {
                resource: resource.to_string(),
                amount,
            });
        }

        entry.reserved = (entry.reserved - amount).max(0.0);
        entry.recompute_available();
        debug!(resource, amount, reserved = entry.reserved, "Released capacity");
        Ok(())
    }

    /// Apply an external usage reading for one resource.
    pub async fn set_usage(&self, resource: &str, used: f64) -> Result<(), ResourceError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(resource)
            .ok_or_else(|| ResourceError::UnknownResource(resource.to_string()))?;
        entry.apply_usage(used);
        Ok(())
    }

    /// Recompute usage for every resource from `probe`. Returns the new state.
    pub async fn refresh(&self, probe: &dyn UsageProbe) -> BTreeMap<String, ResourceEntry> {
        let mut entries = self.entries.write().await;
        for (name, entry) in entries.iter_mut() {
            let reading = probe.sample(name, entry);
            entry.apply_usage(reading);
        }
        entries.clone()
    }

    /// Current state of one resource.
    pub async fn get(&self, resource: &str) -> Option<ResourceEntry> {
        self.entries.read().await.get(resource).cloned()
    }

    /// Current state of all resources, ordered by name.
    pub async fn snapshot(&self) -> BTreeMap<String, ResourceEntry> {
        self.entries.read().await.clone()
    }
}
