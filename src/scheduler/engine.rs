//! Scheduler — submission, dispatch, completion, retry and timeout reclamation.
//!
//! All bookkeeping (queues, worker slots, in-flight attempts, history,
//! metrics) lives in one `Core` behind a single mutex, so assigning a task to
//! a worker and reclaiming it are atomic with respect to each other. Task
//! bodies run as independent tokio tasks and report back through
//! `finish_attempt`, keyed by an attempt id so that a late report from an
//! attempt the watchdog already reclaimed is ignored.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{SchedulerError, TaskError};
use crate::events::EngineEvent;
use crate::metrics::{Metrics, TaskStats, WorkerStats};
use crate::scheduler::history::{CompletedTaskRecord, TaskHistory};
use crate::scheduler::queue::{Enqueued, PriorityQueues};
use crate::scheduler::task::{
    Priority, Task, TaskExecutor, TaskHandle, TaskId, TaskOutcome, TaskPayload, TaskSpec,
    TaskState,
};
use crate::scheduler::worker::WorkerPool;

/// Lifecycle of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting submissions.
    Accepting,
    /// Finishing queued and in-flight work; new submissions rejected.
    Draining,
    /// Abandoning queued work and waiting for in-flight attempts.
    ShuttingDown,
    /// Nothing left running.
    Stopped,
}

impl Lifecycle {
    fn accepts_submissions(self) -> bool {
        self == Self::Accepting
    }

    fn dispatches(self) -> bool {
        matches!(self, Self::Accepting | Self::Draining)
    }

    fn allows_retry(self) -> bool {
        matches!(self, Self::Accepting | Self::Draining)
    }
}

/// A task currently held by a worker.
struct ActiveProcess<P> {
    task: Task<P>,
    worker: usize,
    attempt_id: Uuid,
    started_at: Instant,
    abort: Option<AbortHandle>,
}

impl<P> ActiveProcess<P> {
    fn abort(&mut self) {
        if let Some(handle) = self.abort.take() {
            handle.abort();
        }
    }
}

struct Core<P> {
    lifecycle: Lifecycle,
    queues: PriorityQueues<P>,
    workers: WorkerPool,
    active: HashMap<TaskId, ActiveProcess<P>>,
    history: TaskHistory,
    metrics: Metrics,
}

struct Shared<P: TaskPayload> {
    config: EngineConfig,
    executor: Arc<dyn TaskExecutor<P>>,
    core: Mutex<Core<P>>,
    events: broadcast::Sender<EngineEvent>,
    /// Wakes the dispatcher early after a submission or a freed worker.
    wake: Notify,
    /// Signalled whenever an attempt finishes or work is abandoned.
    settled: Notify,
}

/// Priority scheduler over a fixed worker pool.
pub struct Scheduler<P: TaskPayload> {
    inner: Arc<Shared<P>>,
}

impl<P: TaskPayload> Clone for Scheduler<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: TaskPayload> Scheduler<P> {
    /// Create a new scheduler.
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn TaskExecutor<P>>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        for i in 0..config.worker_count {
            tracing::debug!("Initialized worker: worker-{}", i);
        }
        let core = Core {
            lifecycle: Lifecycle::Accepting,
            queues: PriorityQueues::new(config.max_queue_length, config.backpressure_limit),
            workers: WorkerPool::new(config.worker_count),
            active: HashMap::new(),
            history: TaskHistory::new(config.history_capacity),
            metrics: Metrics::default(),
        };
        Self {
            inner: Arc::new(Shared {
                config,
                executor,
                core: Mutex::new(core),
                events,
                wake: Notify::new(),
                settled: Notify::new(),
            }),
        }
    }

    fn emit(&self, event: EngineEvent) {
        // Ok if nobody is listening
        let _ = self.inner.events.send(event);
    }

    /// Queue a task for execution.
    pub async fn submit(&self, spec: TaskSpec<P>) -> Result<TaskHandle, SchedulerError> {
        let (task, handle) = Task::from_spec(spec, &self.inner.config);
        let mut core = self.inner.core.lock().await;

        if !core.lifecycle.accepts_submissions() {
            tracing::warn!(task_id = %task.id, lifecycle = ?core.lifecycle, "Rejected submission");
            return Err(SchedulerError::NotAccepting);
        }
        if core.active.contains_key(&task.id) || core.queues.contains(&task.id) {
            tracing::warn!(task_id = %task.id, "Rejected duplicate task id");
            return Err(SchedulerError::DuplicateTask {
                id: task.id.to_string(),
            });
        }
        if let Err(e) = core.queues.check_capacity(task.priority) {
            tracing::warn!(task_id = %task.id, priority = %task.priority, "Queue full, applying backpressure");
            return Err(e);
        }

        tracing::debug!(
            task_id = %task.id,
            task_type = %task.task_type(),
            priority = %task.priority,
            "Task queued"
        );
        self.enqueue(&mut core, task);
        drop(core);

        self.inner.wake.notify_one();
        Ok(handle)
    }

    fn enqueue(&self, core: &mut Core<P>, task: Task<P>) {
        let task_id = task.id.clone();
        let priority = task.priority;

        if let Enqueued::Evicted(mut oldest) = core.queues.push(task) {
            tracing::warn!(
                task_id = %oldest.id,
                priority = %oldest.priority,
                "Queue over capacity, evicted oldest task"
            );
            if let Err(e) = oldest.transition_to(TaskState::Evicted) {
                tracing::error!("{}", e);
            }
            core.metrics.record_eviction();
            self.emit(EngineEvent::TaskEvicted {
                task_id: oldest.id.clone(),
                priority: oldest.priority,
            });
            oldest.resolve(TaskOutcome::Evicted);
        }

        self.emit(EngineEvent::TaskQueued { task_id, priority });
    }

    /// One dispatcher tick: assign queued tasks to idle workers, highest
    /// priority first. Returns the number of tasks dispatched.
    pub async fn dispatch_pending(&self) -> usize {
        let mut core = self.inner.core.lock().await;
        if !core.lifecycle.dispatches() {
            return 0;
        }

        let idle = core.workers.idle();
        if idle.is_empty() {
            return 0;
        }

        let mut dispatched = 0;
        for worker in idle {
            let Some(task) = core.queues.pop_next() else {
                break;
            };
            self.start_attempt(&mut core, worker, task);
            dispatched += 1;
        }
        dispatched
    }

    fn start_attempt(&self, core: &mut Core<P>, worker: usize, mut task: Task<P>) {
        if let Err(e) = core.workers.assign(worker, &task.id) {
            // Unreachable while the core lock is held; requeue rather than lose the task.
            tracing::error!(task_id = %task.id, "Worker assignment failed: {}", e);
            core.queues.push(task);
            return;
        }
        if let Err(e) = task.transition_to(TaskState::Running) {
            tracing::error!("{}", e);
        }

        let attempt_id = Uuid::new_v4();
        let started_at = Instant::now();
        let ctx = task.context(started_at);
        let payload = Arc::clone(&task.payload);
        let executor = Arc::clone(&self.inner.executor);
        let task_id = task.id.clone();
        let this = self.clone();

        tracing::debug!(
            task_id = %task.id,
            worker = %core.workers.get(worker).map(|w| w.id.as_str()).unwrap_or("?"),
            attempt = task.attempt(),
            priority = %task.priority,
            "Dispatched task"
        );

        let handle: JoinHandle<()> = tokio::spawn(async move {
            let result = AssertUnwindSafe(async move { executor.execute(ctx, payload).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))));
            this.finish_attempt(&task_id, attempt_id, result).await;
        });

        core.active.insert(
            task.id.clone(),
            ActiveProcess {
                task,
                worker,
                attempt_id,
                started_at,
                abort: Some(handle.abort_handle()),
            },
        );
    }

    /// Completion report from a task body.
    async fn finish_attempt(
        &self,
        task_id: &TaskId,
        attempt_id: Uuid,
        result: Result<serde_json::Value, TaskError>,
    ) {
        let mut core = self.inner.core.lock().await;

        let is_current = core
            .active
            .get(task_id)
            .is_some_and(|p| p.attempt_id == attempt_id);
        if !is_current {
            tracing::debug!(task_id = %task_id, "Ignoring report from reclaimed attempt");
            return;
        }
        let Some(process) = core.active.remove(task_id) else {
            return;
        };

        match result {
            Ok(value) => self.complete(&mut core, process, value),
            Err(error) => self.fail(&mut core, process, error),
        }
        drop(core);

        self.inner.wake.notify_one();
        self.inner.settled.notify_waiters();
    }

    fn complete(&self, core: &mut Core<P>, process: ActiveProcess<P>, value: serde_json::Value) {
        let ActiveProcess {
            mut task,
            worker,
            started_at,
            ..
        } = process;
        let elapsed = started_at.elapsed();

        core.workers.release(worker, elapsed, true);
        core.metrics.record_success(task.task_type(), elapsed);
        core.history.push(CompletedTaskRecord {
            task_id: task.id.clone(),
            task_type: task.task_type().to_string(),
            priority: task.priority,
            attempt: task.attempt(),
            result: Ok(value.clone()),
            completed_at: Utc::now(),
            elapsed,
        });

        if let Err(e) = task.transition_to(TaskState::Completed) {
            tracing::error!("{}", e);
        }
        tracing::debug!(task_id = %task.id, elapsed_ms = elapsed.as_millis() as u64, "Task completed");

        self.emit(EngineEvent::TaskCompleted {
            task_id: task.id.clone(),
            result: value.clone(),
        });
        let attempts = task.attempt();
        task.resolve(TaskOutcome::Completed {
            result: value,
            attempts,
            elapsed,
        });
    }

    /// Failure path shared by execution errors and watchdog timeouts.
    fn fail(&self, core: &mut Core<P>, process: ActiveProcess<P>, error: TaskError) {
        let ActiveProcess {
            mut task,
            worker,
            started_at,
            ..
        } = process;
        let elapsed = started_at.elapsed();

        core.workers.release(worker, elapsed, false);
        core.metrics
            .record_failure(matches!(error, TaskError::TimedOut { .. }));
        core.history.push(CompletedTaskRecord {
            task_id: task.id.clone(),
            task_type: task.task_type().to_string(),
            priority: task.priority,
            attempt: task.attempt(),
            result: Err(error.clone()),
            completed_at: Utc::now(),
            elapsed,
        });

        tracing::warn!(
            task_id = %task.id,
            task_type = %task.task_type(),
            attempt = task.attempt(),
            "Task failed: {}",
            error
        );

        if !core.lifecycle.allows_retry() {
            self.cancel(core, task, "shutdown");
            return;
        }

        if task.can_retry() {
            task.prepare_retry();
            if let Err(e) = task.transition_to(TaskState::Queued) {
                tracing::error!("{}", e);
            }
            core.metrics.record_retry();
            tracing::info!(
                task_id = %task.id,
                priority = %task.priority,
                "Task queued for retry ({}/{})",
                task.retries,
                task.max_retries
            );
            self.emit(EngineEvent::TaskRetried {
                task_id: task.id.clone(),
                attempt: task.attempt(),
                priority: task.priority,
                error,
            });
            self.enqueue(core, task);
            return;
        }

        if let Err(e) = task.transition_to(TaskState::Failed) {
            tracing::error!("{}", e);
        }
        self.emit(EngineEvent::TaskFailed {
            task_id: task.id.clone(),
            error: error.clone(),
        });
        let attempts = task.attempt();
        task.resolve(TaskOutcome::Failed { error, attempts });
    }

    fn cancel(&self, core: &mut Core<P>, mut task: Task<P>, reason: &str) {
        if let Err(e) = task.transition_to(TaskState::Cancelled) {
            tracing::error!("{}", e);
        }
        core.metrics.record_cancellation();
        self.emit(EngineEvent::TaskCancelled {
            task_id: task.id.clone(),
            reason: reason.to_string(),
        });
        task.resolve(TaskOutcome::Cancelled {
            reason: reason.to_string(),
        });
    }

    /// Watchdog sweep: force-fail every attempt that outlived its timeout.
    /// Returns the number of workers reclaimed.
    pub async fn sweep_timeouts(&self) -> usize {
        let mut core = self.inner.core.lock().await;

        let expired: Vec<TaskId> = core
            .active
            .iter()
            .filter(|(_, p)| p.started_at.elapsed() > p.task.timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in &expired {
            let Some(mut process) = core.active.remove(task_id) else {
                continue;
            };
            tracing::warn!(
                task_id = %task_id,
                elapsed_ms = process.started_at.elapsed().as_millis() as u64,
                "Task timed out"
            );
            process.abort();
            let timeout = process.task.timeout;
            self.fail(&mut core, process, TaskError::TimedOut { timeout });
        }
        drop(core);

        if !expired.is_empty() {
            self.inner.wake.notify_one();
            self.inner.settled.notify_waiters();
        }
        expired.len()
    }

    /// Stretch the duration estimate of every queued `background` task.
    pub async fn throttle_background(&self, factor: f64) -> usize {
        let mut core = self.inner.core.lock().await;
        let mut throttled = 0;
        for task in core.queues.level_mut(Priority::Background) {
            task.estimated_duration = stretch(task.estimated_duration, factor);
            throttled += 1;
        }
        throttled
    }

    /// Stop accepting submissions; queued and in-flight work continues.
    pub async fn begin_drain(&self) {
        let mut core = self.inner.core.lock().await;
        if core.lifecycle == Lifecycle::Accepting {
            core.lifecycle = Lifecycle::Draining;
            tracing::info!("Scheduler draining");
        }
    }

    /// Stop accepting submissions and cancel everything still queued.
    /// Returns the number of queued tasks cancelled.
    pub async fn begin_shutdown(&self) -> usize {
        let mut core = self.inner.core.lock().await;
        if matches!(core.lifecycle, Lifecycle::ShuttingDown | Lifecycle::Stopped) {
            return 0;
        }
        core.lifecycle = Lifecycle::ShuttingDown;

        let queued = core.queues.drain_all();
        let cancelled = queued.len();
        for task in queued {
            self.cancel(&mut core, task, "shutdown");
        }
        drop(core);

        tracing::info!(cancelled, "Scheduler shutting down");
        self.inner.settled.notify_waiters();
        cancelled
    }

    /// Abort every in-flight attempt and mark the scheduler stopped.
    /// Returns the number of attempts aborted.
    pub async fn abort_active(&self) -> usize {
        let mut core = self.inner.core.lock().await;
        let ids: Vec<TaskId> = core.active.keys().cloned().collect();
        for task_id in &ids {
            if let Some(mut process) = core.active.remove(task_id) {
                tracing::warn!(task_id = %task_id, "Aborting in-flight task");
                process.abort();
                core.workers
                    .release(process.worker, process.started_at.elapsed(), false);
                self.cancel(&mut core, process.task, "aborted at shutdown");
            }
        }
        core.lifecycle = Lifecycle::Stopped;
        drop(core);

        self.inner.settled.notify_waiters();
        ids.len()
    }

    /// Wait until queues and workers are empty, dispatching along the way.
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self.inner.settled.notified();
            self.dispatch_pending().await;
            if self.is_idle().await {
                return true;
            }

            let tick = tokio::time::Instant::now() + self.inner.config.dispatch_interval;
            let wake_at = tick.min(deadline);
            let _ = tokio::time::timeout_at(wake_at, settled).await;
            if tokio::time::Instant::now() >= deadline {
                return self.is_idle().await;
            }
        }
    }

    /// No queued and no in-flight tasks.
    pub async fn is_idle(&self) -> bool {
        let core = self.inner.core.lock().await;
        core.queues.is_empty() && core.active.is_empty()
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.inner.core.lock().await.lifecycle
    }

    /// Worker and task statistics for a performance snapshot.
    pub async fn stats(&self) -> (WorkerStats, TaskStats) {
        let core = self.inner.core.lock().await;
        let depths = core.queues.depths();
        let tasks = TaskStats {
            queued: depths.iter().sum(),
            queued_by_priority: Priority::ALL.iter().copied().zip(depths).collect(),
            active: core.active.len(),
            completed: core.history.len(),
            totals: core.metrics.clone(),
        };
        (WorkerStats::from_slots(core.workers.slots()), tasks)
    }

    /// Most recent finished attempts, newest first.
    pub async fn recent_completions(&self, limit: usize) -> Vec<CompletedTaskRecord> {
        self.inner.core.lock().await.history.recent(limit)
    }

    /// Ids of tasks currently held by a worker, mapped to the worker id.
    pub async fn active_assignments(&self) -> HashMap<TaskId, String> {
        let core = self.inner.core.lock().await;
        core.active
            .iter()
            .filter_map(|(id, p)| {
                core.workers
                    .get(p.worker)
                    .map(|w| (id.clone(), w.id.clone()))
            })
            .collect()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

/// Ceiling for stretched duration estimates; repeated throttling saturates here.
pub const MAX_ESTIMATED_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

fn stretch(estimate: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(estimate.as_secs_f64() * factor)
        .unwrap_or(MAX_ESTIMATED_DURATION)
        .min(MAX_ESTIMATED_DURATION)
}

/// Spawn the dispatcher loop. Ticks on `interval` and whenever woken early.
pub fn spawn_dispatcher<P: TaskPayload>(
    scheduler: Scheduler<P>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = scheduler.inner.wake.notified() => {}
            }
            scheduler.dispatch_pending().await;
        }
    })
}

/// Spawn the watchdog loop.
pub fn spawn_watchdog<P: TaskPayload>(
    scheduler: Scheduler<P>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Watchdog shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let reclaimed = scheduler.sweep_timeouts().await;
                    if reclaimed > 0 {
                        tracing::info!(reclaimed, "Watchdog reclaimed workers");
                    }
                }
            }
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
