//! Bounded history of finished attempts, most recent first.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::TaskError;
use crate::scheduler::task::{Priority, TaskId};

/// Snapshot of one finished attempt.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedTaskRecord {
    pub task_id: TaskId,
    pub task_type: String,
    pub priority: Priority,
    pub attempt: u32,
    pub result: Result<serde_json::Value, TaskError>,
    pub completed_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl CompletedTaskRecord {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fixed-capacity record list; the oldest entry is evicted on overflow.
#[derive(Debug)]
pub struct TaskHistory {
    records: VecDeque<CompletedTaskRecord>,
    capacity: usize,
}

impl TaskHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: CompletedTaskRecord) {
        if self.capacity == 0 {
            return;
        }
        self.records.push_front(record);
        self.records.truncate(self.capacity);
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<CompletedTaskRecord> {
        self.records.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
