use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ExecutionContext, ExecutionResult};

/// Handler: one executable node type.
///
/// Returning `Err` and returning `ExecutionResult::Error` are equivalent:
/// both count as a handler fault once they reach the dispatcher.
pub trait Handler: Send + Sync {
    fn execute<'a>(
        &'a self,
        input: serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>>;
}

/// Resolves named credentials into key/value maps.
pub trait CredentialResolver: Send + Sync + 'static {
    fn get_credential(&self, key: &str) -> BoxFuture<'_, Result<Option<HashMap<String, String>>>>;
}

/// Key-value store with TTL support.
///
/// Backs circuit records, cache entries, and worker heartbeats. Expired
/// keys must behave exactly like absent ones.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>>;

    /// Upsert a value. `ttl = None` keeps it until deleted.
    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> BoxFuture<'_, Result<()>>;

    /// Atomically replace the value at `key` if it currently equals `expected`
    /// (`None` meaning absent). `new = None` deletes. Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<String>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Atomically increment an integer value, creating it at 1.
    fn incr(&self, key: &str) -> BoxFuture<'_, Result<i64>>;

    /// Delete a key. Returns whether it existed.
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool>>;

    /// List the live keys starting with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Reset the TTL of an existing key. Returns whether the key existed.
    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, Result<bool>>;

    /// Reclaim the space held by expired keys. Returns how many were removed.
    fn purge_expired(&self) -> BoxFuture<'_, Result<usize>>;
}

/// FIFO list store with readable depth.
pub trait QueueStore: Send + Sync + 'static {
    fn push(&self, queue: &str, item: String) -> BoxFuture<'_, Result<()>>;

    fn pop(&self, queue: &str) -> BoxFuture<'_, Result<Option<String>>>;

    fn len(&self, queue: &str) -> BoxFuture<'_, Result<u64>>;
}
