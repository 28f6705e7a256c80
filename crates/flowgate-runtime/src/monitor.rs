use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flowgate_core::clock::{Clock, SystemClock};
use flowgate_core::config::WorkerConfig;
use flowgate_core::traits::{KvStore, QueueStore};

use crate::infra::InfraGuard;

const HEARTBEAT_PREFIX: &str = "worker:heartbeat:";

/// Liveness record a worker keeps refreshing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub worker_type: String,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    /// Pending runs per queue.
    pub queues: BTreeMap<String, u64>,
    pub total_pending: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub message: String,
    pub active_workers: usize,
    pub workers: Vec<WorkerHeartbeat>,
    pub queues: QueueStats,
    pub timestamp: DateTime<Utc>,
}

struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Writes one heartbeat record. Owned by the spawned loop.
struct Beacon {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    guard: Arc<InfraGuard>,
    key: String,
    worker_id: String,
    worker_type: String,
    hostname: String,
    ttl: Duration,
}

impl Beacon {
    async fn beat(&self) -> bool {
        let record = WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            worker_type: self.worker_type.clone(),
            timestamp: self.clock.now(),
            hostname: self.hostname.clone(),
        };
        let encoded = match serde_json::to_string(&record) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.guard
            .try_call("heartbeat", self.store.set(&self.key, encoded, Some(self.ttl)))
            .await
            .is_some()
    }
}

/// Worker liveness and queue-depth observability.
///
/// Heartbeats expire on their own after three intervals, so a crashed
/// worker drops out of the active set without deregistering.
pub struct WorkerMonitor {
    kv: Arc<dyn KvStore>,
    queues: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    worker_id: String,
    hostname: String,
    guard: Arc<InfraGuard>,
    task: Mutex<Option<HeartbeatTask>>,
}

impl WorkerMonitor {
    pub fn new(kv: Arc<dyn KvStore>, queues: Arc<dyn QueueStore>, config: WorkerConfig) -> Self {
        let hostname = hostname();
        let short_id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            kv,
            queues,
            clock: Arc::new(SystemClock),
            config,
            worker_id: format!("{}-{}", hostname, &short_id[..8]),
            hostname,
            guard: Arc::new(InfraGuard::new("worker_monitor")),
            task: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store_faults(&self) -> u64 {
        self.guard.faults()
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.heartbeat_interval_secs.max(1))
    }

    fn beacon(&self, worker_type: &str) -> Beacon {
        Beacon {
            store: self.kv.clone(),
            clock: self.clock.clone(),
            guard: self.guard.clone(),
            key: format!("{}{}", HEARTBEAT_PREFIX, self.worker_id),
            worker_id: self.worker_id.clone(),
            worker_type: worker_type.to_string(),
            hostname: self.hostname.clone(),
            ttl: self.interval() * 3,
        }
    }

    /// Write a single heartbeat now. Returns whether it reached the store.
    pub async fn send_heartbeat(&self, worker_type: &str) -> bool {
        self.beacon(worker_type).beat().await
    }

    /// Announce this worker immediately, then keep renewing in the background.
    /// A second call while the loop runs does nothing.
    pub async fn start_heartbeat(&self, worker_type: &str) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!(worker_id = %self.worker_id, "Heartbeat already running");
            return;
        }

        let beacon = self.beacon(worker_type);
        beacon.beat().await;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let interval = self.interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => break,
                }
                beacon.beat().await;
            }
        });

        info!(
            worker_id = %self.worker_id,
            worker_type,
            interval_secs = interval.as_secs(),
            "Heartbeat started"
        );
        *task = Some(HeartbeatTask { cancel, handle });
    }

    /// Stop renewing and remove this worker's record.
    pub async fn stop_heartbeat(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                debug!(error = %e, "Heartbeat task ended abnormally");
            }
        }
        let key = format!("{}{}", HEARTBEAT_PREFIX, self.worker_id);
        self.guard.call("remove_heartbeat", self.kv.delete(&key), false).await;
        info!(worker_id = %self.worker_id, "Heartbeat stopped");
    }

    /// Workers with a live heartbeat, sorted by id.
    pub async fn get_active_workers(&self) -> Vec<WorkerHeartbeat> {
        let keys = self
            .guard
            .call("scan_workers", self.kv.scan_prefix(HEARTBEAT_PREFIX), Vec::new())
            .await;

        let mut workers = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.guard.call("read_worker", self.kv.get(&key), None).await else {
                continue;
            };
            match serde_json::from_str::<WorkerHeartbeat>(&raw) {
                Ok(hb) => workers.push(hb),
                Err(e) => debug!(key = %key, error = %e, "Unreadable heartbeat, skipping"),
            }
        }
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    /// Reclaim expired records (heartbeats, cache entries) from the store.
    pub async fn purge_expired(&self) -> usize {
        let removed = self
            .guard
            .call("purge_expired", self.kv.purge_expired(), 0)
            .await;
        if removed > 0 {
            debug!(removed, "Purged expired records");
        }
        removed
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for queue in &self.config.queues {
            let pending = self.guard.call("queue_len", self.queues.len(queue), 0).await;
            stats.queues.insert(queue.clone(), pending);
            stats.total_pending += pending;
        }
        stats
    }

    pub async fn get_health_status(&self) -> HealthReport {
        let workers = self.get_active_workers().await;
        let queues = self.get_queue_stats().await;

        let (status, message) = if workers.is_empty() {
            (HealthLevel::Critical, "No active workers".to_string())
        } else if queues.total_pending > self.config.warning_threshold {
            (
                HealthLevel::Warning,
                format!("High queue depth ({} jobs)", queues.total_pending),
            )
        } else {
            (HealthLevel::Healthy, "All systems operational".to_string())
        };

        HealthReport {
            status,
            message,
            active_workers: workers.len(),
            workers,
            queues,
            timestamp: self.clock.now(),
        }
    }
}

/// Host name from `HOSTNAME`, then `/etc/hostname`, else `localhost`.
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
