//! Integration tests for the engine's public API.
//!
//! Tests that need deterministic dispatch leave the engine unstarted and
//! drive `dispatch_pending` / `sweep_timeouts` by hand; the rest start the
//! background loops with short intervals.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, broadcast};
use tokio::time::timeout;

use sync_engine::Engine;
use sync_engine::config::EngineConfig;
use sync_engine::error::{ResourceError, SchedulerError, StateError, TaskError};
use sync_engine::events::EngineEvent;
use sync_engine::scheduler::{
    Priority, TaskContext, TaskExecutor, TaskOutcome, TaskPayload, TaskSpec,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

enum TestJob {
    Echo(u64),
    Fail,
    Hang,
    /// Waits for a permit before completing.
    Gated(Arc<Semaphore>),
}

impl TaskPayload for TestJob {
    fn task_type(&self) -> &str {
        match self {
            Self::Echo(_) => "echo",
            Self::Fail => "fail",
            Self::Hang => "hang",
            Self::Gated(_) => "gated",
        }
    }
}

struct TestExecutor;

#[async_trait]
impl TaskExecutor<TestJob> for TestExecutor {
    async fn execute(&self, ctx: TaskContext, payload: Arc<TestJob>) -> Result<Value, TaskError> {
        match payload.as_ref() {
            TestJob::Echo(n) => Ok(json!({ "n": n, "attempt": ctx.attempt })),
            TestJob::Fail => Err(TaskError::execution("always fails")),
            TestJob::Hang => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
            TestJob::Gated(gate) => {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|e| TaskError::execution(e.to_string()))?;
                Ok(json!("released"))
            }
        }
    }
}

/// Config with fast loops so started engines react within milliseconds.
fn fast_config(workers: usize) -> EngineConfig {
    EngineConfig {
        worker_count: workers,
        dispatch_interval: Duration::from_millis(10),
        watchdog_interval: Duration::from_millis(20),
        resource_refresh_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

fn engine(config: EngineConfig) -> Engine<TestJob> {
    Engine::new(config, Arc::new(TestExecutor)).unwrap()
}

/// Collect every event already sitting in the receiver.
fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Scheduling ──────────────────────────────────────────────────────

#[tokio::test]
async fn two_workers_run_two_of_three_critical_tasks() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine(fast_config(2));
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let spec = TaskSpec::new(TestJob::Gated(gate.clone())).with_priority(Priority::Critical);
            handles.push(engine.submit(spec).await.unwrap());
        }

        assert_eq!(engine.dispatch_pending().await, 2);
        let snapshot = engine.performance_metrics().await;
        assert_eq!(snapshot.workers.busy, 2);
        assert_eq!(snapshot.workers.idle, 0);
        assert_eq!(snapshot.tasks.active, 2);
        assert_eq!(snapshot.tasks.queued, 1);

        gate.add_permits(3);
        engine.start().await.unwrap();
        for handle in handles {
            assert!(handle.outcome().await.is_completed());
        }

        let snapshot = engine.performance_metrics().await;
        assert_eq!(snapshot.tasks.totals.total_processed, 3);
        assert_eq!(snapshot.workers.idle, 2);
        engine.shutdown(Duration::from_millis(10)).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn higher_priority_dispatches_first() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine(fast_config(1));
        let low = engine
            .submit(TaskSpec::new(TestJob::Echo(1)).with_priority(Priority::Low))
            .await
            .unwrap();
        let critical = engine
            .submit(TaskSpec::new(TestJob::Echo(2)).with_priority(Priority::Critical))
            .await
            .unwrap();

        engine.dispatch_pending().await;
        assert!(critical.outcome().await.is_completed());

        let records = engine.recent_completions(10).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].priority, Priority::Critical);

        engine.dispatch_pending().await;
        assert!(low.outcome().await.is_completed());
        let records = engine.recent_completions(10).await;
        assert_eq!(records[0].priority, Priority::Low);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failing_task_escalates_then_fails_terminally() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine(fast_config(2));
        let mut rx = engine.subscribe_events();
        engine.start().await.unwrap();

        let handle = engine
            .submit(
                TaskSpec::new(TestJob::Fail)
                    .with_priority(Priority::Normal)
                    .with_max_retries(3),
            )
            .await
            .unwrap();
        let task_id = handle.id().clone();

        match handle.outcome().await {
            TaskOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 4);
                assert_eq!(error, TaskError::execution("always fails"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let events = drain_events(&mut rx);
        let retried: Vec<Priority> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::TaskRetried { priority, .. } => Some(*priority),
                _ => None,
            })
            .collect();
        assert_eq!(
            retried,
            vec![Priority::High, Priority::Critical, Priority::Critical]
        );
        let terminal_failures = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::TaskFailed { task_id: id, .. } if *id == task_id))
            .count();
        assert_eq!(terminal_failures, 1);

        let snapshot = engine.performance_metrics().await;
        assert_eq!(snapshot.tasks.queued, 0);
        assert_eq!(snapshot.tasks.active, 0);
        let totals = snapshot.tasks.totals;
        assert_eq!(totals.total_failed, 4);
        assert_eq!(totals.total_retried, 3);
        assert_eq!(totals.total_processed, 0);
        engine.shutdown(Duration::from_millis(10)).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn watchdog_reclaims_timed_out_worker() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine(fast_config(1));
        engine.start().await.unwrap();

        let stuck = engine
            .submit(
                TaskSpec::new(TestJob::Hang)
                    .with_timeout(Duration::from_millis(50))
                    .with_max_retries(0),
            )
            .await
            .unwrap();

        match stuck.outcome().await {
            TaskOutcome::Failed {
                error: TaskError::TimedOut { timeout: limit },
                attempts,
            } => {
                assert_eq!(limit, Duration::from_millis(50));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // The reclaimed worker picks up new work
        let next = engine.submit(TaskSpec::new(TestJob::Echo(7))).await.unwrap();
        assert!(next.outcome().await.is_completed());
        assert_eq!(
            engine.performance_metrics().await.tasks.totals.total_timed_out,
            1
        );
        engine.shutdown(Duration::from_millis(10)).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn full_low_queue_evicts_oldest() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine(EngineConfig {
            max_queue_length: 2,
            ..fast_config(1)
        });
        let mut rx = engine.subscribe_events();

        let mut handles = Vec::new();
        for n in 0..3 {
            let spec = TaskSpec::new(TestJob::Echo(n))
                .with_id(format!("low-{n}"))
                .with_priority(Priority::Low);
            handles.push(engine.submit(spec).await.unwrap());
        }

        let oldest = handles.remove(0);
        assert_eq!(oldest.outcome().await, TaskOutcome::Evicted);
        assert!(drain_events(&mut rx).iter().any(|e| matches!(
            e,
            EngineEvent::TaskEvicted { task_id, priority: Priority::Low } if task_id.as_str() == "low-0"
        )));

        let snapshot = engine.performance_metrics().await;
        assert_eq!(snapshot.tasks.queued_by_priority[&Priority::Low], 2);
        assert_eq!(snapshot.tasks.totals.total_evicted, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn backpressure_rejects_high_priority_overflow() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine(EngineConfig {
            backpressure_limit: 2,
            ..fast_config(1)
        });
        for _ in 0..2 {
            engine.submit(TaskSpec::new(TestJob::Echo(0))).await.unwrap();
        }
        let err = engine
            .submit(TaskSpec::new(TestJob::Echo(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull { limit: 2, .. }));

        // Other priorities have their own budget
        engine
            .submit(TaskSpec::new(TestJob::Echo(0)).with_priority(Priority::High))
            .await
            .unwrap();
    })
    .await
    .expect("test timed out");
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn drain_finishes_work_then_rejects_submissions() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine(fast_config(2));
        engine.start().await.unwrap();

        let handles = futures::future::join_all(
            (0..4).map(|n| engine.submit(TaskSpec::new(TestJob::Echo(n)))),
        )
        .await;

        assert!(engine.drain(Duration::from_secs(2)).await);
        for handle in handles {
            assert!(handle.unwrap().outcome().await.is_completed());
        }

        let err = engine
            .submit(TaskSpec::new(TestJob::Echo(9)))
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::NotAccepting);
        engine.shutdown(Duration::from_millis(10)).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_resolves_every_handle() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine(fast_config(1));
        let running = engine.submit(TaskSpec::new(TestJob::Hang)).await.unwrap();
        engine.dispatch_pending().await;
        let queued_a = engine.submit(TaskSpec::new(TestJob::Echo(1))).await.unwrap();
        let queued_b = engine
            .submit(TaskSpec::new(TestJob::Echo(2)).with_priority(Priority::Background))
            .await
            .unwrap();

        engine.start().await.unwrap();
        engine.shutdown(Duration::from_millis(50)).await;

        for handle in [running, queued_a, queued_b] {
            assert!(matches!(
                handle.outcome().await,
                TaskOutcome::Cancelled { .. }
            ));
        }
        let snapshot = engine.performance_metrics().await;
        assert_eq!(snapshot.tasks.active, 0);
        assert_eq!(snapshot.tasks.queued, 0);
        assert_eq!(snapshot.workers.idle, 1);
    })
    .await
    .expect("test timed out");
}

// ── Resources ───────────────────────────────────────────────────────

#[tokio::test]
async fn reservation_beyond_availability_is_rejected() {
    let engine = engine(fast_config(1));

    engine.reserve_resource("cpu", 80.0).await.unwrap();
    let err = engine.reserve_resource("cpu", 30.0).await.unwrap_err();
    assert!(matches!(err, ResourceError::Insufficient { .. }));

    let cpu = engine.resource("cpu").await.unwrap();
    assert_eq!(cpu.reserved, 80.0);
    assert_eq!(cpu.available, 20.0);

    engine.release_resource("cpu", 80.0).await.unwrap();
    assert_eq!(engine.resource("cpu").await.unwrap().available, 100.0);

    assert!(matches!(
        engine.reserve_resource("quantum", 1.0).await,
        Err(ResourceError::UnknownResource(_))
    ));
}

#[tokio::test]
async fn resource_refresh_loop_broadcasts() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine(fast_config(1));
        let mut events = engine.event_stream();
        engine.start().await.unwrap();

        loop {
            match events.next().await {
                Some(Ok(EngineEvent::ResourcesUpdated { resources })) => {
                    for entry in resources.values() {
                        let total = entry.available + entry.used + entry.reserved;
                        assert!((total - 100.0).abs() < 1e-9);
                    }
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
        engine.shutdown(Duration::from_millis(10)).await;
    })
    .await
    .expect("test timed out");
}

// ── Shared state ────────────────────────────────────────────────────

#[tokio::test]
async fn versioned_update_detects_conflicts() {
    let engine = engine(fast_config(1));
    assert_eq!(engine.get_state("user").await.unwrap().version, 1);

    let v2 = engine
        .update_state("user", "name", json!("ada"), None)
        .await
        .unwrap();
    assert_eq!(v2, 2);

    let err = engine
        .update_state("user", "name", json!("grace"), Some(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StateError::VersionMismatch {
            expected: 1,
            actual: 2,
            ..
        }
    ));

    let v3 = engine
        .update_state("user", "name", json!("grace"), Some(2))
        .await
        .unwrap();
    assert_eq!(v3, 3);

    let keyed = engine.get_state_key("user", "name").await.unwrap();
    assert_eq!(keyed.value, Some(json!("grace")));
    assert_eq!(keyed.version, 3);

    assert!(matches!(
        engine.get_state("galaxy").await,
        Err(StateError::UnknownCategory(_))
    ));
}

#[tokio::test]
async fn locked_category_rejects_writes() {
    let engine = engine(fast_config(1));

    assert!(engine.state_categories().contains(&"session".to_string()));
    assert!(!engine.is_state_locked("session").await.unwrap());

    engine.lock_state("session").await.unwrap();
    assert!(engine.is_state_locked("session").await.unwrap());
    assert!(matches!(
        engine.lock_state("session").await,
        Err(StateError::AlreadyLocked(_))
    ));
    assert!(matches!(
        engine.update_state("session", "k", json!(1), None).await,
        Err(StateError::Locked(_))
    ));
    assert_eq!(engine.get_state("session").await.unwrap().version, 1);

    engine.unlock_state("session").await.unwrap();
    engine.unlock_state("session").await.unwrap();
    assert!(!engine.is_state_locked("session").await.unwrap());
    assert!(matches!(
        engine.is_state_locked("galaxy").await,
        Err(StateError::UnknownCategory(_))
    ));
    assert_eq!(
        engine
            .update_state("session", "k", json!(1), None)
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn subscribers_see_changes_until_unsubscribed() {
    let engine = engine(fast_config(1));
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = seen.clone();
    let id = engine
        .subscribe_to_state("application", Some("theme"), move |change| {
            assert_eq!(change.key, "theme");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    engine
        .subscribe_to_state("application", None, |_| Err(anyhow::anyhow!("broken subscriber")))
        .await
        .unwrap();

    engine
        .update_state("application", "theme", json!("dark"), None)
        .await
        .unwrap();
    engine
        .update_state("application", "font", json!("mono"), None)
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    engine.unsubscribe_from_state("application", id).await.unwrap();
    engine
        .update_state("application", "theme", json!("light"), None)
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    assert!(matches!(
        engine.unsubscribe_from_state("application", id).await,
        Err(StateError::UnknownSubscription { .. })
    ));
}
