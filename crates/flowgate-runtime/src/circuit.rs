use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use flowgate_core::clock::{Clock, SystemClock};
use flowgate_core::config::CircuitBreakerConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::KvStore;

use crate::infra::InfraGuard;

const KEY_PREFIX: &str = "circuit:";

/// Compare-and-swap rounds before an update gives up.
const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Persisted breaker state for one node type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    #[serde(default)]
    pub state: CircuitState,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub half_open_calls: u32,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Operator view of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub node_type: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_until_recovery: Option<i64>,
}

/// Per-node-type failure gate shared by every run and worker on a store.
///
/// Each node type has a single record mutated through compare-and-swap, so
/// concurrent callers never lose an update. Any store fault fails open.
pub struct CircuitBreaker {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
    guard: InfraGuard,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn KvStore>, config: CircuitBreakerConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            guard: InfraGuard::new("circuit_breaker"),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Store faults absorbed so far.
    pub fn store_faults(&self) -> u64 {
        self.guard.faults()
    }

    fn key(node_type: &str) -> String {
        format!("{}{}", KEY_PREFIX, node_type)
    }

    fn recovery(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.recovery_timeout_secs as i64)
    }

    /// Read-modify-write the record for `node_type`.
    ///
    /// `apply` returns the record to write (`None` leaves the store alone)
    /// and a value handed back to the caller. It is re-run on every CAS
    /// conflict, so it must not have side effects.
    async fn update<T, F>(&self, node_type: &str, mut apply: F) -> Result<T>
    where
        F: FnMut(CircuitRecord) -> (Option<CircuitRecord>, T) + Send,
        T: Send,
    {
        let key = Self::key(node_type);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.store.get(&key).await?;
            let (next, out) = apply(decode(&key, raw.as_deref()));
            let Some(next) = next else {
                return Ok(out);
            };
            let encoded = serde_json::to_string(&next)?;
            if self
                .store
                .compare_and_swap(&key, raw.as_deref(), Some(encoded), None)
                .await?
            {
                return Ok(out);
            }
            debug!(node_type, "Circuit record changed underneath, retrying");
        }
        Err(FlowgateError::Contention(key))
    }

    async fn read(&self, node_type: &str) -> Result<CircuitRecord> {
        let key = Self::key(node_type);
        let raw = self.store.get(&key).await?;
        Ok(decode(&key, raw.as_deref()))
    }

    /// Decide whether a call to `node_type` may proceed.
    pub async fn check(&self, node_type: &str) -> Admission {
        let now = self.clock.now();
        let recovery = self.recovery();
        let max_trials = self.config.half_open_max_calls;

        let decision = self.update(node_type, |mut record| match record.state {
            CircuitState::Closed => (None, Admission::Admitted),
            CircuitState::Open => {
                let recovered = record.opened_at.is_some_and(|at| now - at > recovery);
                if recovered {
                    record.state = CircuitState::HalfOpen;
                    record.half_open_calls = 0;
                    (Some(record), Admission::Admitted)
                } else {
                    let reason = format!(
                        "Circuit breaker open due to repeated failures: {}",
                        record.last_error.as_deref().unwrap_or("Unknown error")
                    );
                    (None, Admission::Rejected(reason))
                }
            }
            CircuitState::HalfOpen => {
                if record.half_open_calls < max_trials {
                    record.half_open_calls += 1;
                    (Some(record), Admission::Admitted)
                } else {
                    (
                        None,
                        Admission::Rejected(
                            "Circuit breaker in half-open state (max test calls reached)".into(),
                        ),
                    )
                }
            }
        });

        self.guard.call("check", decision, Admission::Admitted).await
    }

    /// Any success closes the circuit and clears its counters.
    pub async fn record_success(&self, node_type: &str) {
        let recovered = self.update(node_type, |record| {
            if record == CircuitRecord::default() {
                (None, false)
            } else {
                let was_tripped = record.state != CircuitState::Closed;
                (Some(CircuitRecord::default()), was_tripped)
            }
        });
        if self.guard.call("record_success", recovered, false).await {
            info!(node_type, "Circuit closed (recovered)");
        }
    }

    pub async fn record_failure(&self, node_type: &str, error: &str) {
        let now = self.clock.now();
        let threshold = self.config.failure_threshold;

        let opened = self.update(node_type, |mut record| {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.last_error = Some(error.to_string());
            let failures = record.consecutive_failures;
            let trips = failures >= threshold && record.state != CircuitState::Open;
            if trips {
                record.state = CircuitState::Open;
                record.opened_at = Some(now);
                record.half_open_calls = 0;
            }
            (Some(record), trips.then_some(failures))
        });

        if let Some(failures) = self.guard.call("record_failure", opened, None).await {
            warn!(node_type, failures, error, "Circuit opened");
        }
    }

    /// Clear a circuit back to closed. Returns whether a record existed.
    pub async fn reset(&self, node_type: &str) -> bool {
        let key = Self::key(node_type);
        let existed = self.guard.call("reset", self.store.delete(&key), false).await;
        info!(node_type, existed, "Circuit reset");
        existed
    }

    pub async fn status(&self, node_type: &str) -> CircuitStatus {
        let record = self
            .guard
            .call("status", self.read(node_type), CircuitRecord::default())
            .await;
        self.describe(node_type, record)
    }

    /// Status of every tracked node type, sorted by id.
    pub async fn list(&self) -> Vec<CircuitStatus> {
        let mut keys = self
            .guard
            .call("list", self.store.scan_prefix(KEY_PREFIX), Vec::new())
            .await;
        keys.sort();

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(node_type) = key.strip_prefix(KEY_PREFIX) {
                out.push(self.status(node_type).await);
            }
        }
        out
    }

    fn describe(&self, node_type: &str, record: CircuitRecord) -> CircuitStatus {
        let (opened_at, recovery_at, seconds_until_recovery) =
            match (record.state, record.opened_at) {
                (CircuitState::Open, Some(at)) => {
                    let recovery_at = at + self.recovery();
                    let remaining = (recovery_at - self.clock.now()).num_seconds().max(0);
                    (Some(at), Some(recovery_at), Some(remaining))
                }
                _ => (None, None, None),
            };
        CircuitStatus {
            node_type: node_type.to_string(),
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            threshold: self.config.failure_threshold,
            last_error: record.last_error,
            opened_at,
            recovery_at,
            seconds_until_recovery,
        }
    }
}

/// Parse a stored record. A missing or unreadable value is a fresh circuit.
fn decode(key: &str, raw: Option<&str>) -> CircuitRecord {
    match raw {
        None => CircuitRecord::default(),
        Some(s) => serde_json::from_str(s).unwrap_or_else(|e| {
            debug!(key, error = %e, "Unreadable circuit record, treating as closed");
            CircuitRecord::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_store::MemoryStore;
    use flowgate_test_utils::{FaultyStore, ManualClock};
    use std::time::Duration;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let cb = CircuitBreaker::new(store, CircuitBreakerConfig::default()).with_clock(clock.clone());
        (cb, clock)
    }

    async fn trip(cb: &CircuitBreaker, node_type: &str) {
        for i in 0..5 {
            cb.record_failure(node_type, &format!("HTTP 503 #{}", i)).await;
        }
    }

    #[tokio::test]
    async fn test_opens_at_threshold_with_last_error() {
        let (cb, _) = breaker();
        for i in 0..4 {
            cb.record_failure("slack_send", &format!("HTTP 503 #{}", i)).await;
            assert!(cb.check("slack_send").await.is_admitted());
        }
        cb.record_failure("slack_send", "HTTP 401 Unauthorized").await;

        match cb.check("slack_send").await {
            Admission::Rejected(reason) => {
                assert_eq!(
                    reason,
                    "Circuit breaker open due to repeated failures: HTTP 401 Unauthorized"
                );
            }
            Admission::Admitted => panic!("circuit should be open"),
        }
        let status = cb.status("slack_send").await;
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.consecutive_failures, 5);
        assert_eq!(status.seconds_until_recovery, Some(300));
    }

    #[tokio::test]
    async fn test_success_between_failures_resets_count() {
        let (cb, _) = breaker();
        for _ in 0..4 {
            cb.record_failure("x", "boom").await;
        }
        cb.record_success("x").await;
        for _ in 0..4 {
            cb.record_failure("x", "boom").await;
        }
        assert!(cb.check("x").await.is_admitted());
        assert_eq!(cb.status("x").await.consecutive_failures, 4);
    }

    #[tokio::test]
    async fn test_half_open_after_recovery_timeout() {
        let (cb, clock) = breaker();
        trip(&cb, "x").await;

        clock.advance(Duration::from_secs(300));
        assert!(!cb.check("x").await.is_admitted(), "boundary is exclusive");

        clock.advance(Duration::from_secs(1));
        assert!(cb.check("x").await.is_admitted());
        let record = cb.read("x").await.unwrap();
        assert_eq!(record.state, CircuitState::HalfOpen);
        assert_eq!(record.half_open_calls, 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_budget() {
        let (cb, clock) = breaker();
        trip(&cb, "x").await;
        clock.advance(Duration::from_secs(301));

        assert!(cb.check("x").await.is_admitted()); // transition
        for _ in 0..3 {
            assert!(cb.check("x").await.is_admitted());
        }
        assert_eq!(
            cb.check("x").await,
            Admission::Rejected("Circuit breaker in half-open state (max test calls reached)".into())
        );
    }

    #[tokio::test]
    async fn test_single_success_closes_from_open_and_half_open() {
        let (cb, clock) = breaker();
        trip(&cb, "open").await;
        cb.record_success("open").await;
        let status = cb.status("open").await;
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
        assert!(cb.check("open").await.is_admitted());

        trip(&cb, "half").await;
        clock.advance(Duration::from_secs(301));
        assert!(cb.check("half").await.is_admitted());
        cb.record_success("half").await;
        assert_eq!(cb.status("half").await.state, CircuitState::Closed);
        assert_eq!(cb.read("half").await.unwrap(), CircuitRecord::default());
    }

    #[tokio::test]
    async fn test_failure_in_half_open_reopens() {
        let (cb, clock) = breaker();
        trip(&cb, "x").await;
        clock.advance(Duration::from_secs(301));
        assert!(cb.check("x").await.is_admitted());

        cb.record_failure("x", "still broken").await;
        let status = cb.status("x").await;
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.opened_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_reset_and_list() {
        let (cb, _) = breaker();
        trip(&cb, "b_node").await;
        cb.record_failure("a_node", "once").await;

        let listed: Vec<_> = cb.list().await.into_iter().map(|s| s.node_type).collect();
        assert_eq!(listed, vec!["a_node", "b_node"]);

        assert!(cb.reset("b_node").await);
        assert!(cb.check("b_node").await.is_admitted());
        assert_eq!(cb.list().await.len(), 1);
        assert!(!cb.reset("never_seen").await);
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_all_counted() {
        let store = Arc::new(MemoryStore::new());
        let config = CircuitBreakerConfig {
            failure_threshold: 100,
            ..Default::default()
        };
        let cb = CircuitBreaker::new(store, config);
        futures::future::join_all((0..20).map(|_| cb.record_failure("x", "e"))).await;
        assert_eq!(cb.status("x").await.consecutive_failures, 20);
    }

    #[tokio::test]
    async fn test_store_fault_fails_open() {
        let cb = CircuitBreaker::new(Arc::new(FaultyStore), CircuitBreakerConfig::default());
        for _ in 0..10 {
            cb.record_failure("x", "boom").await;
            assert!(cb.check("x").await.is_admitted());
        }
        cb.record_success("x").await;
        assert!(cb.list().await.is_empty());
        assert_eq!(cb.status("x").await.state, CircuitState::Closed);
        assert!(cb.store_faults() >= 21);
    }

    #[tokio::test]
    async fn test_corrupt_record_treated_as_closed() {
        let store = Arc::new(MemoryStore::new());
        store.set("circuit:x", "{not json".into(), None).await.unwrap();
        let cb = CircuitBreaker::new(store, CircuitBreakerConfig::default());
        assert!(cb.check("x").await.is_admitted());
        cb.record_failure("x", "boom").await;
        assert_eq!(cb.status("x").await.consecutive_failures, 1);
    }
}
