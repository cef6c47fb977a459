//! Priority queue set — one FIFO queue per priority level.

use std::collections::VecDeque;

use crate::error::SchedulerError;
use crate::scheduler::task::{Priority, Task, TaskId};

/// Result of pushing a task.
#[derive(Debug)]
pub enum Enqueued<P> {
    /// Task appended.
    Accepted,
    /// Task appended and the oldest task of a trimmable queue was dropped.
    Evicted(Task<P>),
}

/// Five FIFO queues, drained highest priority first.
pub struct PriorityQueues<P> {
    queues: [VecDeque<Task<P>>; 5],
    max_queue_length: usize,
    backpressure_limit: usize,
}

impl<P> PriorityQueues<P> {
    pub fn new(max_queue_length: usize, backpressure_limit: usize) -> Self {
        Self {
            queues: Default::default(),
            max_queue_length,
            backpressure_limit,
        }
    }

    /// Check whether a new submission at `priority` would be accepted.
    ///
    /// Only `critical`/`high`/`normal` apply backpressure; the lower levels
    /// evict instead.
    pub fn check_capacity(&self, priority: Priority) -> Result<(), SchedulerError> {
        if !priority.is_trimmable() && self.queues[priority.index()].len() >= self.backpressure_limit {
            return Err(SchedulerError::QueueFull {
                priority: priority.to_string(),
                limit: self.backpressure_limit,
            });
        }
        Ok(())
    }

    /// Append a task to the queue for its priority.
    pub fn push(&mut self, task: Task<P>) -> Enqueued<P> {
        let priority = task.priority;
        let queue = &mut self.queues[priority.index()];
        queue.push_back(task);

        if priority.is_trimmable()
            && queue.len() > self.max_queue_length
            && let Some(oldest) = queue.pop_front()
        {
            return Enqueued::Evicted(oldest);
        }
        Enqueued::Accepted
    }

    /// Pop the oldest task of the highest non-empty level.
    pub fn pop_next(&mut self) -> Option<Task<P>> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.queues.iter().flatten().any(|t| &t.id == id)
    }

    /// Depth of each level, highest first.
    pub fn depths(&self) -> [usize; 5] {
        let mut depths = [0; 5];
        for (depth, queue) in depths.iter_mut().zip(&self.queues) {
            *depth = queue.len();
        }
        depths
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Mutable access to one level, e.g. for throttling adjustments.
    pub fn level_mut(&mut self, priority: Priority) -> impl Iterator<Item = &mut Task<P>> {
        self.queues[priority.index()].iter_mut()
    }

    /// Remove every queued task, highest priority first.
    pub fn drain_all(&mut self) -> Vec<Task<P>> {
        self.queues.iter_mut().flat_map(|q| q.drain(..)).collect()
    }
}
