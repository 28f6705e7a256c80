use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use flowgate_core::error::{FlowgateError, Result};

/// The one place where backing-store faults are absorbed.
///
/// Cache, circuit breaker, and worker monitor route every store round-trip
/// through their guard. A failed call is logged, counted, and replaced by a
/// neutral fallback, so a store outage degrades to misses, admissions, and
/// skipped beats instead of failing runs.
#[derive(Debug)]
pub struct InfraGuard {
    component: &'static str,
    faults: AtomicU64,
}

impl InfraGuard {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            faults: AtomicU64::new(0),
        }
    }

    /// Await `fut`, substituting `fallback` if it fails.
    pub async fn call<T, F>(&self, op: &str, fut: F, fallback: T) -> T
    where
        F: Future<Output = Result<T>>,
    {
        self.try_call(op, fut).await.unwrap_or(fallback)
    }

    /// Await `fut`, returning `None` if it fails.
    pub async fn try_call<T, F>(&self, op: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match fut.await {
            Ok(value) => Some(value),
            Err(e) => {
                self.record(op, &e);
                None
            }
        }
    }

    /// Count a fault that was detected without a failing call.
    pub fn record(&self, op: &str, error: &FlowgateError) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        warn!(
            component = self.component,
            op,
            error = %error,
            "Backing store unavailable, degrading"
        );
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.faults.store(0, Ordering::Relaxed);
    }

    pub fn component(&self) -> &'static str {
        self.component
    }
}
