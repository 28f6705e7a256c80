use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowgate_core::config::WorkerConfig;
use flowgate_core::error::Result;
use flowgate_core::traits::QueueStore;
use flowgate_core::types::QueuedRun;

use crate::graph::{GraphEngine, RunOptions, RunReport};
use crate::infra::InfraGuard;
use crate::monitor::WorkerMonitor;

/// Put a run on `queue` for the next free worker.
pub async fn enqueue(queues: &dyn QueueStore, queue: &str, run: &QueuedRun) -> Result<()> {
    let encoded = serde_json::to_string(run)?;
    queues.push(queue, encoded).await?;
    debug!(queue, run_id = %run.run_id, "Run enqueued");
    Ok(())
}

/// What a single poll of the queues produced.
#[derive(Debug)]
pub enum PollOutcome {
    /// Every queue was empty or unreachable.
    Idle,
    /// The popped item was not a run.
    Dropped,
    Finished(RunReport),
    /// The run's graph did not validate.
    Rejected(String),
}

/// Pulls queued runs and executes them, one at a time.
pub struct QueueWorker {
    engine: Arc<GraphEngine>,
    queues: Arc<dyn QueueStore>,
    monitor: Arc<WorkerMonitor>,
    config: WorkerConfig,
    guard: InfraGuard,
}

impl QueueWorker {
    pub fn new(
        engine: Arc<GraphEngine>,
        queues: Arc<dyn QueueStore>,
        monitor: Arc<WorkerMonitor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            engine,
            queues,
            monitor,
            config,
            guard: InfraGuard::new("worker"),
        }
    }

    pub fn monitor(&self) -> &WorkerMonitor {
        &self.monitor
    }

    /// Take the first available run, scanning queues in priority order.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> PollOutcome {
        for queue in &self.config.queues {
            let raw = match self.guard.try_call("pop", self.queues.pop(queue)).await {
                Some(Some(raw)) => raw,
                Some(None) => continue,
                None => return PollOutcome::Idle,
            };

            let run: QueuedRun = match serde_json::from_str(&raw) {
                Ok(run) => run,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Dropping malformed queue item");
                    return PollOutcome::Dropped;
                }
            };

            info!(queue = %queue, run_id = %run.run_id, "Picked up run");
            let options = RunOptions {
                run_id: Some(run.run_id.clone()),
                cancel: cancel.child_token(),
                ..Default::default()
            };
            return match self
                .engine
                .run_with(Arc::new(run.workflow), run.input, options)
                .await
            {
                Ok(report) => PollOutcome::Finished(report),
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "Queued run rejected");
                    PollOutcome::Rejected(e.to_string())
                }
            };
        }
        PollOutcome::Idle
    }

    /// Serve the queues until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        let purge_every = Duration::from_secs(self.config.purge_interval_secs.max(1));
        let mut last_purge = tokio::time::Instant::now();
        self.monitor.start_heartbeat(&self.config.worker_type).await;
        info!(
            worker_id = %self.monitor.worker_id(),
            queues = ?self.config.queues,
            "Worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if last_purge.elapsed() >= purge_every {
                self.monitor.purge_expired().await;
                last_purge = tokio::time::Instant::now();
            }
            match self.poll_once(&cancel).await {
                PollOutcome::Idle => {
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                PollOutcome::Finished(report) => {
                    info!(
                        run_id = %report.run_id,
                        status = %report.status,
                        elapsed_ms = report.elapsed_ms,
                        "Run finished"
                    );
                }
                PollOutcome::Dropped | PollOutcome::Rejected(_) => {}
            }
        }

        self.monitor.stop_heartbeat().await;
        let cache = self.engine.dispatcher().cache().stats();
        info!(
            worker_id = %self.monitor.worker_id(),
            cache_hits = cache.hits,
            cache_misses = cache.misses,
            cache_hit_rate = cache.hit_rate,
            cache_store_errors = cache.store_errors,
            "Worker stopped"
        );
    }
}
