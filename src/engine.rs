//! Engine facade — one explicit instance owning the scheduler, the resource
//! ledger, the state store and the event channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{ConfigError, ResourceError, SchedulerError, StateError};
use crate::events::EngineEvent;
use crate::metrics::{AdvisoryReport, AdvisoryThresholds, PerformanceSnapshot, advise};
use crate::resources::{RandomWalkProbe, ResourceEntry, ResourceLedger, UsageProbe};
use crate::scheduler::engine::{spawn_dispatcher, spawn_watchdog};
use crate::scheduler::{
    CompletedTaskRecord, Lifecycle, Scheduler, TaskExecutor, TaskHandle, TaskPayload, TaskSpec,
};
use crate::shared::{CategorySnapshot, KeyedValue, StateChange, StateStore, SubscriptionId};

/// Factor applied to queued background estimates when resources run low.
const BACKGROUND_THROTTLE: f64 = 1.5;

struct EngineInner<P: TaskPayload> {
    config: EngineConfig,
    scheduler: Scheduler<P>,
    ledger: ResourceLedger,
    states: StateStore,
    probe: Arc<dyn UsageProbe>,
    events: broadcast::Sender<EngineEvent>,
    shutdown: CancellationToken,
    started: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Coordination engine. Cheap to clone; all clones share one instance.
pub struct Engine<P: TaskPayload> {
    inner: Arc<EngineInner<P>>,
}

impl<P: TaskPayload> Clone for Engine<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: TaskPayload> Engine<P> {
    /// Build an engine using the simulated random-walk usage signal.
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn TaskExecutor<P>>,
    ) -> Result<Self, ConfigError> {
        Self::with_probe(config, executor, Arc::new(RandomWalkProbe::default()))
    }

    /// Build an engine with a custom usage probe for the resource refresh.
    pub fn with_probe(
        config: EngineConfig,
        executor: Arc<dyn TaskExecutor<P>>,
        probe: Arc<dyn UsageProbe>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let scheduler = Scheduler::new(config.clone(), executor, events.clone());
        let ledger = ResourceLedger::new(config.resources.iter().cloned());
        let states = StateStore::new(config.state_categories.iter().cloned());

        tracing::info!(
            workers = config.worker_count,
            categories = config.state_categories.len(),
            resources = config.resources.len(),
            "Engine initialized"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                scheduler,
                ledger,
                states,
                probe,
                events,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                loops: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Queue a task; the handle resolves with its terminal outcome.
    pub async fn submit(&self, spec: TaskSpec<P>) -> Result<TaskHandle, SchedulerError> {
        self.inner.scheduler.submit(spec).await
    }

    /// Run one dispatcher tick immediately.
    pub async fn dispatch_pending(&self) -> usize {
        self.inner.scheduler.dispatch_pending().await
    }

    /// Run one watchdog sweep immediately.
    pub async fn sweep_timeouts(&self) -> usize {
        self.inner.scheduler.sweep_timeouts().await
    }

    /// Most recent finished attempts, newest first.
    pub async fn recent_completions(&self, limit: usize) -> Vec<CompletedTaskRecord> {
        self.inner.scheduler.recent_completions(limit).await
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.inner.scheduler.lifecycle().await
    }

    // ── Shared state ────────────────────────────────────────────────

    /// Names of the shared-state categories.
    pub fn state_categories(&self) -> Vec<String> {
        self.inner.states.categories()
    }

    pub async fn is_state_locked(&self, category: &str) -> Result<bool, StateError> {
        self.inner.states.is_locked(category).await
    }

    pub async fn get_state(&self, category: &str) -> Result<CategorySnapshot, StateError> {
        self.inner.states.get(category).await
    }

    pub async fn get_state_key(&self, category: &str, key: &str) -> Result<KeyedValue, StateError> {
        self.inner.states.get_key(category, key).await
    }

    /// Write one key; with `expected_version` the write only succeeds if the
    /// category is still at that version. Returns the new version.
    pub async fn update_state(
        &self,
        category: &str,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StateError> {
        self.inner
            .states
            .update(category, key, value, expected_version)
            .await
    }

    pub async fn lock_state(&self, category: &str) -> Result<(), StateError> {
        self.inner.states.lock(category).await
    }

    pub async fn unlock_state(&self, category: &str) -> Result<(), StateError> {
        self.inner.states.unlock(category).await
    }

    /// Register a callback for changes to `key`, or every key when `None`.
    pub async fn subscribe_to_state<F>(
        &self,
        category: &str,
        key: Option<&str>,
        callback: F,
    ) -> Result<SubscriptionId, StateError>
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .states
            .subscribe(category, key, Arc::new(callback))
            .await
    }

    pub async fn unsubscribe_from_state(
        &self,
        category: &str,
        id: SubscriptionId,
    ) -> Result<(), StateError> {
        self.inner.states.unsubscribe(category, id).await
    }

    // ── Resources ───────────────────────────────────────────────────

    pub async fn reserve_resource(&self, resource: &str, amount: f64) -> Result<(), ResourceError> {
        self.inner.ledger.reserve(resource, amount).await
    }

    pub async fn release_resource(&self, resource: &str, amount: f64) -> Result<(), ResourceError> {
        self.inner.ledger.release(resource, amount).await
    }

    /// Feed an externally measured usage reading into the ledger.
    pub async fn set_resource_usage(&self, resource: &str, used: f64) -> Result<(), ResourceError> {
        self.inner.ledger.set_usage(resource, used).await
    }

    pub async fn resource(&self, resource: &str) -> Option<ResourceEntry> {
        self.inner.ledger.get(resource).await
    }

    /// Sample the usage probe once and broadcast the result.
    pub async fn refresh_resources(&self) -> BTreeMap<String, ResourceEntry> {
        let resources = self.inner.ledger.refresh(self.inner.probe.as_ref()).await;
        let _ = self.inner.events.send(EngineEvent::ResourcesUpdated {
            resources: resources.clone(),
        });
        resources
    }

    // ── Metrics ─────────────────────────────────────────────────────

    pub async fn performance_metrics(&self) -> PerformanceSnapshot {
        let (workers, tasks) = self.inner.scheduler.stats().await;
        PerformanceSnapshot {
            workers,
            tasks,
            resources: self.inner.ledger.snapshot().await,
            timestamp: Utc::now(),
        }
    }

    /// Advisory pass over the current snapshot. Throttles queued background
    /// work when any resource is overloaded; everything else is report-only.
    pub async fn optimize_performance(&self) -> AdvisoryReport {
        let snapshot = self.performance_metrics().await;
        let thresholds = AdvisoryThresholds {
            low_availability: self.inner.config.low_availability_threshold,
            min_worker_efficiency: self.inner.config.min_worker_efficiency,
        };
        let mut report = advise(&snapshot, thresholds);

        if report.needs_more_workers {
            tracing::info!(
                queued = snapshot.tasks.queued,
                workers = snapshot.workers.total,
                "Consider increasing worker count"
            );
        }
        if !report.overloaded_resources.is_empty() {
            report.throttled_tasks = self
                .inner
                .scheduler
                .throttle_background(BACKGROUND_THROTTLE)
                .await;
            tracing::warn!(
                resources = ?report.overloaded_resources,
                throttled = report.throttled_tasks,
                "Resources low, throttling background tasks"
            );
        }
        for worker in &report.inefficient_workers {
            tracing::warn!(worker = %worker, "Worker has low efficiency");
        }

        if !report.is_clear() {
            let _ = self.inner.events.send(EngineEvent::AdvisoryRaised {
                report: report.clone(),
            });
        }
        report
    }

    // ── Events ──────────────────────────────────────────────────────

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Events as a stream. Lagged receivers yield an error item and continue.
    pub fn event_stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.inner.events.subscribe())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Spawn the dispatcher, resource refresh and watchdog loops.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let config = &self.inner.config;
        let token = self.inner.shutdown.clone();
        let handles = vec![
            spawn_dispatcher(
                self.inner.scheduler.clone(),
                config.dispatch_interval,
                token.clone(),
            ),
            spawn_resource_refresh(self.clone(), config.resource_refresh_interval, token.clone()),
            spawn_watchdog(self.inner.scheduler.clone(), config.watchdog_interval, token),
        ];
        self.inner.loops.lock().await.extend(handles);

        tracing::info!("Engine started");
        Ok(())
    }

    /// Stop accepting submissions and wait for queued and in-flight work,
    /// retries included. Returns `false` if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.inner.scheduler.begin_drain().await;
        let drained = self.inner.scheduler.wait_idle(timeout).await;
        if drained {
            tracing::info!("Engine drained");
        } else {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Drain timed out");
        }
        drained
    }

    /// Cancel queued work, give in-flight attempts `grace` to finish, abort
    /// the rest and stop the background loops. Every outstanding handle
    /// resolves before this returns.
    pub async fn shutdown(&self, grace: Duration) {
        let scheduler = &self.inner.scheduler;
        scheduler.begin_shutdown().await;

        let finished = scheduler.wait_idle(grace).await;
        let aborted = scheduler.abort_active().await;
        if !finished {
            tracing::warn!(aborted, "Grace period elapsed, aborted in-flight tasks");
        }

        self.inner.shutdown.cancel();
        let handles: Vec<_> = self.inner.loops.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                tracing::error!("Background loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Engine stopped");
    }
}

fn spawn_resource_refresh<P: TaskPayload>(
    engine: Engine<P>,
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
                    tracing::debug!("Resource refresh shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    engine.refresh_resources().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::TaskError;
    use crate::scheduler::TaskContext;
    use crate::scheduler::task::tests::Job;

    struct EchoExecutor;

    #[async_trait]
    impl TaskExecutor<Job> for EchoExecutor {
        async fn execute(
            &self,
            _ctx: TaskContext,
            payload: Arc<Job>,
        ) -> Result<serde_json::Value, TaskError> {
            Ok(serde_json::json!(payload.0))
        }
    }

    /// Probe pinning every resource at a fixed usage.
    struct FixedProbe(f64);

    impl UsageProbe for FixedProbe {
        fn sample(&self, _resource: &str, _current: &ResourceEntry) -> f64 {
            self.0
        }
    }

    fn engine_with_probe(probe: f64) -> Engine<Job> {
        let config = EngineConfig {
            worker_count: 2,
            ..EngineConfig::default()
        };
        Engine::with_probe(config, Arc::new(EchoExecutor), Arc::new(FixedProbe(probe))).unwrap()
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let config = EngineConfig {
            worker_count: 0,
            ..EngineConfig::default()
        };
        assert!(Engine::<Job>::new(config, Arc::new(EchoExecutor)).is_err());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let engine = engine_with_probe(0.0);
        engine.start().await.unwrap();
        assert_eq!(
            engine.start().await.unwrap_err(),
            SchedulerError::AlreadyStarted
        );
        engine.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn refresh_broadcasts_resources() {
        let engine = engine_with_probe(30.0);
        let mut rx = engine.subscribe_events();

        let resources = engine.refresh_resources().await;
        assert_eq!(resources["cpu"].used, 30.0);
        assert_eq!(resources["cpu"].available, 70.0);

        match rx.recv().await.unwrap() {
            EngineEvent::ResourcesUpdated { resources } => assert_eq!(resources.len(), 5),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn overload_throttles_background_and_raises_advisory() {
        let engine = engine_with_probe(85.0);
        engine.refresh_resources().await;
        engine
            .submit(TaskSpec::new(Job("bg")).with_priority_name("background"))
            .await
            .unwrap();
        let mut rx = engine.subscribe_events();

        let report = engine.optimize_performance().await;
        assert_eq!(report.overloaded_resources.len(), 5);
        assert_eq!(report.throttled_tasks, 1);

        match rx.recv().await.unwrap() {
            EngineEvent::AdvisoryRaised { report: raised } => assert_eq!(raised, report),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_advisory_emits_nothing() {
        let engine = engine_with_probe(10.0);
        engine.refresh_resources().await;
        let mut rx = engine.subscribe_events();

        let report = engine.optimize_performance().await;
        assert!(report.is_clear());
        assert_eq!(report.throttled_tasks, 0);
        assert!(rx.try_recv().is_err());
    }
}
