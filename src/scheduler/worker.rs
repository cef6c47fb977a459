//! Worker pool — fixed execution slots, each idle or holding exactly one task.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::task::TaskId;

/// Status of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

/// One execution slot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSlot {
    pub id: String,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub busy_time: Duration,
}

impl WorkerSlot {
    fn new(index: usize) -> Self {
        Self {
            id: format!("worker-{index}"),
            status: WorkerStatus::Idle,
            current_task: None,
            tasks_completed: 0,
            busy_time: Duration::ZERO,
        }
    }

    /// Completed tasks per second of busy time, `None` before the first completion.
    pub fn efficiency(&self) -> Option<f64> {
        if self.tasks_completed == 0 {
            return None;
        }
        let secs = self.busy_time.as_secs_f64();
        if secs <= f64::EPSILON {
            return Some(f64::INFINITY);
        }
        Some(self.tasks_completed as f64 / secs)
    }
}

/// The fixed set of workers. Created once, never resized.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(WorkerSlot::new).collect(),
        }
    }

    /// Indices of idle workers, lowest first.
    pub fn idle(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, w)| w.status == WorkerStatus::Idle)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn idle_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count()
    }

    /// Mark `index` busy with `task`. Fails if the worker already holds a task.
    pub fn assign(&mut self, index: usize, task: &TaskId) -> Result<(), String> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| format!("no worker at index {index}"))?;
        if slot.status == WorkerStatus::Busy {
            return Err(format!(
                "{} is already running {:?}",
                slot.id, slot.current_task
            ));
        }
        slot.status = WorkerStatus::Busy;
        slot.current_task = Some(task.clone());
        Ok(())
    }

    /// Return `index` to idle, accumulating `elapsed` busy time.
    pub fn release(&mut self, index: usize, elapsed: Duration, completed: bool) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.status = WorkerStatus::Idle;
            slot.current_task = None;
            slot.busy_time += elapsed;
            if completed {
                slot.tasks_completed += 1;
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&WorkerSlot> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }
}
