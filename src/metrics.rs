//! Processing metrics, performance snapshots and the advisory pass.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::resources::ResourceEntry;
use crate::scheduler::task::Priority;
use crate::scheduler::worker::{WorkerSlot, WorkerStatus};

/// Running totals maintained by the scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_timed_out: u64,
    pub total_evicted: u64,
    pub total_cancelled: u64,
    /// Mean elapsed time of successful attempts.
    pub average_processing_time: Duration,
    pub processed_by_type: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn record_success(&mut self, task_type: &str, elapsed: Duration) {
        self.total_processed += 1;
        let n = self.total_processed as f64;
        let avg = self.average_processing_time.as_secs_f64();
        let updated = avg + (elapsed.as_secs_f64() - avg) / n;
        self.average_processing_time = Duration::from_secs_f64(updated.max(0.0));
        *self
            .processed_by_type
            .entry(task_type.to_string())
            .or_default() += 1;
    }

    pub fn record_failure(&mut self, timed_out: bool) {
        self.total_failed += 1;
        if timed_out {
            self.total_timed_out += 1;
        }
    }

    pub fn record_retry(&mut self) {
        self.total_retried += 1;
    }

    pub fn record_eviction(&mut self) {
        self.total_evicted += 1;
    }

    pub fn record_cancellation(&mut self) {
        self.total_cancelled += 1;
    }
}

/// Per-worker throughput.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerEfficiency {
    pub worker_id: String,
    pub tasks_completed: u64,
    pub average_time: Duration,
    /// Completed tasks per busy second.
    pub efficiency: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    /// Only workers with at least one completed task.
    pub efficiency: Vec<WorkerEfficiency>,
}

impl WorkerStats {
    pub fn from_slots(slots: &[WorkerSlot]) -> Self {
        let idle = slots
            .iter()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count();
        let efficiency = slots
            .iter()
            .filter_map(|w| {
                let efficiency = w.efficiency()?;
                Some(WorkerEfficiency {
                    worker_id: w.id.clone(),
                    tasks_completed: w.tasks_completed,
                    average_time: w.busy_time.div_f64(w.tasks_completed as f64),
                    efficiency,
                })
            })
            .collect();
        Self {
            total: slots.len(),
            idle,
            busy: slots.len() - idle,
            efficiency,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub queued: usize,
    pub queued_by_priority: BTreeMap<Priority, usize>,
    pub active: usize,
    /// Records currently held in the completed-task history.
    pub completed: usize,
    pub totals: Metrics,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub workers: WorkerStats,
    pub tasks: TaskStats,
    pub resources: BTreeMap<String, ResourceEntry>,
    pub timestamp: DateTime<Utc>,
}

/// Thresholds for the advisory pass.
#[derive(Debug, Clone, Copy)]
pub struct AdvisoryThresholds {
    pub low_availability: f64,
    pub min_worker_efficiency: f64,
}

/// Findings of one advisory pass. Nothing here is acted on automatically
/// except the background throttle, which the engine applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdvisoryReport {
    pub needs_more_workers: bool,
    pub overloaded_resources: Vec<String>,
    pub inefficient_workers: Vec<String>,
    /// Background tasks whose duration estimate was stretched.
    pub throttled_tasks: usize,
}

impl AdvisoryReport {
    pub fn is_clear(&self) -> bool {
        !self.needs_more_workers
            && self.overloaded_resources.is_empty()
            && self.inefficient_workers.is_empty()
    }
}

/// Inspect a snapshot and flag overload conditions.
pub fn advise(snapshot: &PerformanceSnapshot, thresholds: AdvisoryThresholds) -> AdvisoryReport {
    let needs_more_workers =
        snapshot.tasks.queued > snapshot.workers.total * 2 && snapshot.workers.idle < 2;

    let overloaded_resources = snapshot
        .resources
        .iter()
        .filter(|(_, r)| r.available < thresholds.low_availability)
        .map(|(name, _)| name.clone())
        .collect();

    let inefficient_workers = snapshot
        .workers
        .efficiency
        .iter()
        .filter(|w| w.efficiency < thresholds.min_worker_efficiency)
        .map(|w| w.worker_id.clone())
        .collect();

    AdvisoryReport {
        needs_more_workers,
        overloaded_resources,
        inefficient_workers,
        throttled_tasks: 0,
    }
}
