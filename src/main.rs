use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sync_engine::Engine;
use sync_engine::config::EngineConfig;
use sync_engine::error::TaskError;
use sync_engine::scheduler::{Priority, TaskContext, TaskExecutor, TaskPayload, TaskSpec};

/// Demo workload.
enum DemoJob {
    /// Sum of 1..=n.
    Compute { n: u64 },
    /// Fails until the given attempt.
    Flaky { succeed_on: u32 },
    /// Sleeps, standing in for I/O.
    Sleep { ms: u64 },
}

impl TaskPayload for DemoJob {
    fn task_type(&self) -> &str {
        match self {
            Self::Compute { .. } => "compute",
            Self::Flaky { .. } => "flaky",
            Self::Sleep { .. } => "sleep",
        }
    }
}

struct DemoExecutor;

#[async_trait]
impl TaskExecutor<DemoJob> for DemoExecutor {
    async fn execute(
        &self,
        ctx: TaskContext,
        payload: Arc<DemoJob>,
    ) -> Result<serde_json::Value, TaskError> {
        match *payload {
            DemoJob::Compute { n } => Ok(serde_json::json!({ "sum": (1..=n).sum::<u64>() })),
            DemoJob::Flaky { succeed_on } if ctx.attempt >= succeed_on => {
                Ok(serde_json::json!({ "attempt": ctx.attempt }))
            }
            DemoJob::Flaky { .. } => Err(TaskError::execution(format!(
                "transient failure on attempt {}",
                ctx.attempt
            ))),
            DemoJob::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(ms).min(ctx.remaining())).await;
                Ok(serde_json::json!({ "slept_ms": ms }))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing();

    let config = EngineConfig::from_env()?;
    eprintln!("⚙️  Sync Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.worker_count);
    eprintln!("   Task timeout: {:?}\n", config.default_timeout);

    let engine = Engine::new(config, Arc::new(DemoExecutor))?;

    // ── Event log ────────────────────────────────────────────────────
    let mut events = engine.event_stream();
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::debug!(event = %json, "Engine event"),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                },
                Err(e) => tracing::warn!("Event stream lagged: {}", e),
            }
        }
    });

    engine.start().await?;

    // ── Shared state ─────────────────────────────────────────────────
    let subscription = engine
        .subscribe_to_state("session", Some("phase"), |change| {
            tracing::info!(
                version = change.version,
                value = %change.value,
                "Session phase changed"
            );
            Ok(())
        })
        .await?;
    let version = engine
        .update_state("session", "phase", serde_json::json!("running"), None)
        .await?;

    // ── Resources ────────────────────────────────────────────────────
    engine.reserve_resource("cpu", 40.0).await?;

    // ── Tasks ────────────────────────────────────────────────────────
    let specs = vec![
        TaskSpec::new(DemoJob::Compute { n: 1_000 }).with_priority(Priority::Critical),
        TaskSpec::new(DemoJob::Flaky { succeed_on: 2 }),
        TaskSpec::new(DemoJob::Sleep { ms: 200 }).with_priority(Priority::Low),
        TaskSpec::new(DemoJob::Sleep { ms: 50 }).with_priority(Priority::Background),
        TaskSpec::new(DemoJob::Compute { n: 10 }).with_priority(Priority::High),
    ];
    let mut handles = Vec::with_capacity(specs.len());
    for spec in specs {
        handles.push(engine.submit(spec).await?);
    }

    for handle in handles {
        let id = handle.id().clone();
        let outcome = handle.outcome().await;
        println!("{id}: {}", serde_json::to_string(&outcome)?);
    }

    engine
        .update_state("session", "phase", serde_json::json!("done"), Some(version))
        .await?;
    engine.unsubscribe_from_state("session", subscription).await?;
    engine.release_resource("cpu", 40.0).await?;

    // ── Report ───────────────────────────────────────────────────────
    let report = engine.optimize_performance().await;
    let snapshot = engine.performance_metrics().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !engine.drain(Duration::from_secs(5)).await {
        tracing::warn!("Work still pending at exit");
    }
    engine.shutdown(Duration::from_secs(1)).await;

    drop(engine);
    let _ = tokio::time::timeout(Duration::from_secs(1), event_log).await;
    Ok(())
}

/// Console logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file when `SYNC_ENGINE_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("SYNC_ENGINE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sync-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
