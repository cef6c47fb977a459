//! Events emitted for external observers.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::TaskError;
use crate::metrics::AdvisoryReport;
use crate::resources::ResourceEntry;
use crate::scheduler::task::{Priority, TaskId};

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Engine lifecycle and task events, fanned out over a broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskQueued {
        task_id: TaskId,
        priority: Priority,
    },
    TaskCompleted {
        task_id: TaskId,
        result: serde_json::Value,
    },
    TaskRetried {
        task_id: TaskId,
        attempt: u32,
        priority: Priority,
        error: TaskError,
    },
    TaskFailed {
        task_id: TaskId,
        error: TaskError,
    },
    TaskEvicted {
        task_id: TaskId,
        priority: Priority,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: String,
    },
    ResourcesUpdated {
        resources: BTreeMap<String, ResourceEntry>,
    },
    AdvisoryRaised {
        report: AdvisoryReport,
    },
}

impl EngineEvent {
    /// Task this event refers to, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskQueued { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskRetried { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskEvicted { task_id, .. }
            | Self::TaskCancelled { task_id, .. } => Some(task_id),
            Self::ResourcesUpdated { .. } | Self::AdvisoryRaised { .. } => None,
        }
    }
}
