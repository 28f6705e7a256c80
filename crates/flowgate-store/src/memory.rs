use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use flowgate_core::clock::{Clock, SystemClock};
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::{KvStore, QueueStore};

use crate::deadline;

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    queues: HashMap<String, VecDeque<String>>,
}

/// In-process store. Every operation runs under one mutex, so
/// read-modify-write primitives are atomic.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| FlowgateError::Store(e.to_string()))
    }

    /// Stored entries, counting expired ones not yet reclaimed.
    pub fn entry_count(&self) -> usize {
        self.lock().map_or(0, |inner| inner.values.len())
    }

    fn live_value(inner: &Inner, key: &str, now: DateTime<Utc>) -> Option<String> {
        inner
            .values
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = self.clock.now();
            let mut inner = self.lock()?;
            if inner.values.get(&key).is_some_and(|e| !e.is_live(now)) {
                inner.values.remove(&key);
                return Ok(None);
            }
            Ok(Self::live_value(&inner, &key, now))
        })
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = self.clock.now();
            let expires_at = ttl.and_then(|t| deadline(now, t));
            let mut inner = self.lock()?;
            inner.values.insert(key, Entry { value, expires_at });
            Ok(())
        })
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<String>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        let expected = expected.map(String::from);
        Box::pin(async move {
            let now = self.clock.now();
            let mut inner = self.lock()?;
            if Self::live_value(&inner, &key, now) != expected {
                return Ok(false);
            }
            match new {
                Some(value) => {
                    let expires_at = ttl.and_then(|t| deadline(now, t));
                    inner.values.insert(key, Entry { value, expires_at });
                }
                None => {
                    inner.values.remove(&key);
                }
            }
            Ok(true)
        })
    }

    fn incr(&self, key: &str) -> BoxFuture<'_, Result<i64>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = self.clock.now();
            let mut inner = self.lock()?;
            let (current, expires_at) = match inner.values.get(&key).filter(|e| e.is_live(now)) {
                Some(entry) => {
                    let n: i64 = entry.value.parse().map_err(|_| {
                        FlowgateError::Store(format!("value at '{}' is not an integer", key))
                    })?;
                    (n, entry.expires_at)
                }
                None => (0, None),
            };
            let next = current + 1;
            inner.values.insert(
                key,
                Entry {
                    value: next.to_string(),
                    expires_at,
                },
            );
            Ok(next)
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = self.clock.now();
            let mut inner = self.lock()?;
            Ok(inner
                .values
                .remove(&key)
                .is_some_and(|e| e.is_live(now)))
        })
    }

    fn scan_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let now = self.clock.now();
            let mut inner = self.lock()?;
            inner.values.retain(|_, e| e.is_live(now));
            let mut keys: Vec<String> = inner
                .values
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = self.clock.now();
            let mut inner = self.lock()?;
            match inner.values.get_mut(&key).filter(|e| e.is_live(now)) {
                Some(entry) => {
                    entry.expires_at = deadline(now, ttl);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn purge_expired(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut inner = self.lock()?;
            let before = inner.values.len();
            inner.values.retain(|_, e| e.is_live(now));
            Ok(before - inner.values.len())
        })
    }
}

impl QueueStore for MemoryStore {
    fn push(&self, queue: &str, item: String) -> BoxFuture<'_, Result<()>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let mut inner = self.lock()?;
            inner.queues.entry(queue).or_default().push_back(item);
            Ok(())
        })
    }

    fn pop(&self, queue: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let mut inner = self.lock()?;
            Ok(inner.queues.get_mut(&queue).and_then(|q| q.pop_front()))
        })
    }

    fn len(&self, queue: &str) -> BoxFuture<'_, Result<u64>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner.queues.get(&queue).map_or(0, |q| q.len() as u64))
        })
    }
}
