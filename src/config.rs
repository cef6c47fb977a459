//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::events::DEFAULT_EVENT_CAPACITY;

/// Default shared-state categories created at startup.
pub const DEFAULT_STATE_CATEGORIES: &[&str] = &["user", "session", "application", "system", "network"];

/// Default tracked resources.
pub const DEFAULT_RESOURCES: &[&str] = &["memory", "cpu", "network", "storage", "gpu"];

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker slots.
    pub worker_count: usize,
    /// Capacity of the `low` and `background` queues before the oldest entry is evicted.
    pub max_queue_length: usize,
    /// Pending-task limit for `critical`/`high`/`normal` above which new submissions are rejected.
    pub backpressure_limit: usize,
    /// Number of completed-task records kept.
    pub history_capacity: usize,
    /// Timeout applied to tasks that don't set one.
    pub default_timeout: Duration,
    /// Retry budget applied to tasks that don't set one.
    pub default_max_retries: u32,
    /// Duration hint applied to tasks that don't set one.
    pub default_estimated_duration: Duration,
    /// Dispatcher tick.
    pub dispatch_interval: Duration,
    /// Resource usage refresh tick.
    pub resource_refresh_interval: Duration,
    /// Watchdog sweep tick.
    pub watchdog_interval: Duration,
    /// Resources with less availability than this (percent) are reported as overloaded.
    pub low_availability_threshold: f64,
    /// Workers completing fewer tasks per busy second than this are flagged.
    pub min_worker_efficiency: f64,
    /// Shared-state categories.
    pub state_categories: Vec<String>,
    /// Tracked resource names.
    pub resources: Vec<String>,
    /// Event broadcast channel capacity.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_count: parallelism.max(2),
            max_queue_length: 50,
            backpressure_limit: 1000,
            history_capacity: 50,
            default_timeout: Duration::from_secs(30),
            default_max_retries: 3,
            default_estimated_duration: Duration::from_secs(1),
            dispatch_interval: Duration::from_millis(100),
            resource_refresh_interval: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(5),
            low_availability_threshold: 20.0,
            min_worker_efficiency: 0.5,
            state_categories: DEFAULT_STATE_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            resources: DEFAULT_RESOURCES.iter().map(|s| s.to_string()).collect(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overlaid with `SYNC_ENGINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize, _>(&lookup, "SYNC_ENGINE_WORKERS")? {
            config.worker_count = n;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "SYNC_ENGINE_MAX_QUEUE_LENGTH")? {
            config.max_queue_length = n;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "SYNC_ENGINE_HISTORY_CAPACITY")? {
            config.history_capacity = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SYNC_ENGINE_TASK_TIMEOUT_MS")? {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "SYNC_ENGINE_MAX_RETRIES")? {
            config.default_max_retries = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SYNC_ENGINE_DISPATCH_INTERVAL_MS")? {
            config.dispatch_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SYNC_ENGINE_RESOURCE_REFRESH_MS")? {
            config.resource_refresh_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SYNC_ENGINE_WATCHDOG_INTERVAL_MS")? {
            config.watchdog_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(invalid("worker_count", "must be at least 1"));
        }
        if self.max_queue_length == 0 {
            return Err(invalid("max_queue_length", "must be at least 1"));
        }
        if self.backpressure_limit == 0 {
            return Err(invalid("backpressure_limit", "must be at least 1"));
        }
        for (key, interval) in [
            ("dispatch_interval", self.dispatch_interval),
            ("resource_refresh_interval", self.resource_refresh_interval),
            ("watchdog_interval", self.watchdog_interval),
        ] {
            if interval.is_zero() {
                return Err(invalid(key, "must be non-zero"));
            }
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &format!("{raw:?}: {e}"))),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
