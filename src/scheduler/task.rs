//! Task types: priorities, specs, lifecycle state and outcome handles.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::TaskError;

/// Unique task identifier, caller-supplied or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(format!("task-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Dispatch priority. Declaration order is dispatch order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    /// All levels, highest first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Position in [`Priority::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// One level closer to `Critical`; `Critical` stays `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            Self::Critical | Self::High => Self::Critical,
            Self::Normal => Self::High,
            Self::Low => Self::Normal,
            Self::Background => Self::Low,
        }
    }

    /// Whether the queue for this level evicts its oldest entry on overflow.
    pub fn is_trimmable(self) -> bool {
        matches!(self, Self::Low | Self::Background)
    }

    /// Parse a priority name, falling back to `Normal` for unknown values.
    pub fn parse_lossy(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| {
            tracing::warn!(priority = %s, "Invalid priority, defaulting to normal");
            Self::Normal
        })
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "background" => Ok(Self::Background),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Typed task parameters. Usually an enum with one variant per task kind.
pub trait TaskPayload: Send + Sync + 'static {
    /// Type tag used for metrics and logging.
    fn task_type(&self) -> &str;
}

/// Runs task bodies. The engine treats the work itself as opaque.
#[async_trait]
pub trait TaskExecutor<P: TaskPayload>: Send + Sync {
    async fn execute(&self, ctx: TaskContext, payload: Arc<P>) -> Result<serde_json::Value, TaskError>;
}

/// Per-attempt context passed to the executor.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: String,
    pub priority: Priority,
    /// 1-based attempt number.
    pub attempt: u32,
    pub estimated_duration: Duration,
    pub timeout: Duration,
    pub started_at: Instant,
}

impl TaskContext {
    /// Time left before the watchdog reclaims this attempt.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started_at.elapsed())
    }
}

/// Submission request.
#[derive(Debug, Clone)]
pub struct TaskSpec<P> {
    pub payload: P,
    pub id: Option<TaskId>,
    pub priority: Priority,
    pub estimated_duration: Option<Duration>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl<P: TaskPayload> TaskSpec<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            id: None,
            priority: Priority::Normal,
            estimated_duration: None,
            timeout: None,
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the priority from a name; unknown names become `Normal`.
    pub fn with_priority_name(mut self, priority: &str) -> Self {
        self.priority = Priority::parse_lossy(priority);
        self
    }

    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = Some(duration);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in a priority queue.
    Queued,
    /// Held by a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed after exhausting its retries.
    Failed,
    /// Dropped from a full low-priority queue.
    Evicted,
    /// Abandoned by shutdown.
    Cancelled,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Evicted) | (Queued, Cancelled) |
            // Running → Queued is a retry
            (Running, Completed) | (Running, Failed) |
            (Running, Queued) | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Evicted | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Evicted => "evicted",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Terminal result delivered through a [`TaskHandle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        result: serde_json::Value,
        attempts: u32,
        elapsed: Duration,
    },
    Failed {
        error: TaskError,
        attempts: u32,
    },
    Evicted,
    Cancelled {
        reason: String,
    },
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Returned by `submit`; resolves once the task reaches a terminal state.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> TaskOutcome {
        self.rx.await.unwrap_or_else(|_| TaskOutcome::Cancelled {
            reason: "engine dropped".to_string(),
        })
    }

    /// Non-blocking check; `None` while the task is still pending.
    pub fn try_outcome(&mut self) -> Option<TaskOutcome> {
        self.rx.try_recv().ok()
    }
}

/// A unit of work owned by the scheduler.
///
/// Only `priority`, `retries`, `state` and `estimated_duration` change after
/// creation, and only under the scheduler lock.
pub struct Task<P> {
    pub id: TaskId,
    pub payload: Arc<P>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub estimated_duration: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub max_retries: u32,
    pub state: TaskState,
    outcome_tx: Option<oneshot::Sender<TaskOutcome>>,
}

impl<P: TaskPayload> Task<P> {
    /// Build a task from a spec, filling defaults from `config`.
    pub fn from_spec(spec: TaskSpec<P>, config: &EngineConfig) -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let id = spec.id.unwrap_or_else(TaskId::generate);
        let task = Self {
            id: id.clone(),
            payload: Arc::new(spec.payload),
            priority: spec.priority,
            created_at: Utc::now(),
            estimated_duration: spec
                .estimated_duration
                .unwrap_or(config.default_estimated_duration),
            timeout: spec.timeout.unwrap_or(config.default_timeout),
            retries: 0,
            max_retries: spec.max_retries.unwrap_or(config.default_max_retries),
            state: TaskState::Queued,
            outcome_tx: Some(tx),
        };
        (task, TaskHandle { id, rx })
    }

    pub fn task_type(&self) -> &str {
        self.payload.task_type()
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, new_state: TaskState) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.state, new_state
            ));
        }
        self.state = new_state;
        Ok(())
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Record a retry: bump the counter and escalate priority.
    pub fn prepare_retry(&mut self) {
        self.retries += 1;
        self.priority = self.priority.escalate();
    }

    /// 1-based number of the current (or last) attempt.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    /// Deliver the terminal outcome. Later calls are ignored.
    pub fn resolve(&mut self, outcome: TaskOutcome) {
        if let Some(tx) = self.outcome_tx.take() {
            // Receiver may have been dropped by a caller that stopped waiting.
            let _ = tx.send(outcome);
        }
    }

    pub(crate) fn context(&self, started_at: Instant) -> TaskContext {
        TaskContext {
            task_id: self.id.clone(),
            task_type: self.task_type().to_string(),
            priority: self.priority,
            attempt: self.attempt(),
            estimated_duration: self.estimated_duration,
            timeout: self.timeout,
            started_at,
        }
    }
}

impl<P> fmt::Debug for Task<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("retries", &self.retries)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal payload for scheduler unit tests.
    #[derive(Debug, Clone)]
    pub struct Job(pub &'static str);

    impl TaskPayload for Job {
        fn task_type(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn escalation_path_caps_at_critical() {
        let mut p = Priority::Normal;
        let mut path = vec![p];
        for _ in 0..3 {
            p = p.escalate();
            path.push(p);
        }
        assert_eq!(
            path,
            vec![Priority::Normal, Priority::High, Priority::Critical, Priority::Critical]
        );
        assert_eq!(Priority::Background.escalate(), Priority::Low);
    }

    #[test]
    fn priority_order_matches_dispatch_order() {
        let mut sorted = Priority::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Priority::ALL.to_vec());
        assert_eq!(Priority::Critical.index(), 0);
        assert_eq!(Priority::Background.index(), 4);
    }

    #[test]
    fn unknown_priority_defaults_to_normal() {
        assert_eq!(Priority::parse_lossy("HIGH"), Priority::High);
        assert_eq!(Priority::parse_lossy("urgent-ish"), Priority::Normal);
    }

    #[test]
    fn state_transitions() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Queued));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Queued));
        assert!(!TaskState::Queued.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Running));
        assert!(TaskState::Evicted.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn spec_defaults_come_from_config() {
        let config = EngineConfig::default();
        let (task, handle) = Task::from_spec(TaskSpec::new(Job("echo")), &config);
        assert_eq!(task.timeout, config.default_timeout);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(handle.id(), &task.id);
        assert!(task.id.as_str().starts_with("task-"));
    }

    #[tokio::test]
    async fn resolve_delivers_only_first_outcome() {
        let config = EngineConfig::default();
        let (mut task, handle) =
            Task::from_spec(TaskSpec::new(Job("echo")).with_id("t-1"), &config);
        task.resolve(TaskOutcome::Evicted);
        task.resolve(TaskOutcome::Cancelled {
            reason: "late".into(),
        });
        assert_eq!(handle.outcome().await, TaskOutcome::Evicted);
    }

    #[test]
    fn task_state_serde() {
        let json = serde_json::to_string(&TaskState::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let json = serde_json::to_string(&Priority::Background).unwrap();
        assert_eq!(json, "\"background\"");
    }
}
