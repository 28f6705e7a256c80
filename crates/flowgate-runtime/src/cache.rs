use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use flowgate_core::config::CacheConfig;
use flowgate_core::traits::KvStore;
use flowgate_core::types::{ExecutionResult, NodeSettings, VOLATILE_CONFIG_KEYS};

use crate::infra::InfraGuard;

const KEY_PREFIX: &str = "cache:node:";

/// Hit/miss counters for the result cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub store_errors: u64,
    pub total_requests: u64,
    /// Percentage of lookups that hit, rounded to two decimals.
    pub hit_rate: f64,
    pub enabled: bool,
}

/// Deterministic cache key for one logical invocation.
///
/// Execution-mechanics keys (retries, timeout, caching knobs) are dropped
/// from the config first, so tuning them never splits the cache.
pub fn cache_key(node_type: &str, input: &Value, config: &Value) -> String {
    let config = match config {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !VOLATILE_CONFIG_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        _ => Value::Object(Default::default()),
    };

    let mut canonical = String::new();
    write_canonical(
        &mut canonical,
        &serde_json::json!({
            "node_type": node_type,
            "input": input,
            "config": config,
        }),
    );

    let digest = Sha256::digest(canonical.as_bytes());
    let short: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}{}:{}", KEY_PREFIX, node_type, short)
}

/// JSON with object keys sorted at every level.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(out, v);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Result cache for successful node invocations.
///
/// Opt-in twice: the global switch must be on and the node config must say
/// `cacheable = true`. A store fault reads as a miss and drops the write.
pub struct ResultCache {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    guard: InfraGuard,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            guard: InfraGuard::new("cache"),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether an invocation with this config participates in caching.
    pub fn applies(&self, config: &Value) -> bool {
        self.config.enabled && NodeSettings::from_config(config).cacheable == Some(true)
    }

    pub async fn get(
        &self,
        node_type: &str,
        input: &Value,
        config: &Value,
    ) -> Option<ExecutionResult> {
        if !self.applies(config) {
            return None;
        }
        let key = cache_key(node_type, input, config);
        let raw = self.guard.call("get", self.store.get(&key), None).await;

        let hit = raw
            .and_then(|r| serde_json::from_str::<ExecutionResult>(&r).ok())
            .filter(ExecutionResult::is_success);
        match hit {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(node_type, key = %key, "Cache hit");
                Some(result)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a successful result. Errors are never cached.
    pub async fn set(&self, node_type: &str, input: &Value, config: &Value, result: &ExecutionResult) {
        if !self.applies(config) || !result.is_success() {
            return;
        }
        let encoded = match serde_json::to_string(result) {
            Ok(s) => s,
            Err(e) => {
                debug!(node_type, error = %e, "Result not serializable, skipping cache");
                return;
            }
        };
        let ttl_secs = NodeSettings::from_config(config)
            .cache_ttl_secs
            .unwrap_or(self.config.default_ttl_secs);
        let key = cache_key(node_type, input, config);

        let written = self
            .guard
            .try_call(
                "set",
                self.store
                    .set(&key, encoded, Some(Duration::from_secs(ttl_secs))),
            )
            .await;
        if written.is_some() {
            self.writes.fetch_add(1, Ordering::Relaxed);
            debug!(node_type, key = %key, ttl_secs, "Cache write");
        }
    }

    /// Drop every entry for one node type. Returns how many were removed.
    pub async fn invalidate_node_type(&self, node_type: &str) -> usize {
        self.invalidate_prefix(&format!("{}{}:", KEY_PREFIX, node_type))
            .await
    }

    /// Drop every cached result.
    pub async fn flush(&self) -> usize {
        self.invalidate_prefix(KEY_PREFIX).await
    }

    async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let keys = self
            .guard
            .call("scan", self.store.scan_prefix(prefix), Vec::new())
            .await;
        let mut removed = 0;
        for key in keys {
            if self.guard.call("delete", self.store.delete(&key), false).await {
                removed += 1;
            }
        }
        debug!(prefix, removed, "Cache invalidated");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64 * 10_000.0).round() / 100.0
        };
        CacheStats {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            store_errors: self.guard.faults(),
            total_requests: total,
            hit_rate,
            enabled: self.config.enabled,
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.guard.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_store::MemoryStore;
    use flowgate_test_utils::{FaultyStore, ManualClock};
    use serde_json::json;

    fn cache() -> ResultCache {
        ResultCache::new(Arc::new(MemoryStore::new()), CacheConfig::default())
    }

    #[test]
    fn test_key_ignores_volatile_config() {
        let input = json!({"city": "Oslo"});
        let base = cache_key("weather", &input, &json!({"units": "metric", "cacheable": true}));
        let tuned = cache_key(
            "weather",
            &input,
            &json!({"units": "metric", "cacheable": true, "timeout": 5, "retry_count": 3, "cache_ttl": 10, "continue_on_fail": true}),
        );
        assert_eq!(base, tuned);
        assert!(base.starts_with("cache:node:weather:"));
        assert_eq!(base.len(), "cache:node:weather:".len() + 16);
    }

    #[test]
    fn test_key_sensitive_to_logic() {
        let config = json!({"units": "metric"});
        let a = cache_key("weather", &json!({"city": "Oslo"}), &config);
        assert_ne!(a, cache_key("weather", &json!({"city": "Bergen"}), &config));
        assert_ne!(a, cache_key("weather", &json!({"city": "Oslo"}), &json!({"units": "imperial"})));
        assert_ne!(a, cache_key("forecast", &json!({"city": "Oslo"}), &config));
    }

    #[test]
    fn test_key_independent_of_field_order() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": {"x": 1, "y": 2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": {"y": 2, "x": 1}, "a": 1}"#).unwrap();
        assert_eq!(cache_key("n", &a, &json!({})), cache_key("n", &b, &json!({})));
    }

    #[tokio::test]
    async fn test_hit_after_write_and_stats() {
        let cache = cache();
        let config = json!({"cacheable": true});
        let input = json!({"q": 1});
        assert!(cache.get("lookup", &input, &config).await.is_none());

        let result = ExecutionResult::success(json!({"answer": 42}));
        cache.set("lookup", &input, &config, &result).await;
        assert_eq!(cache.get("lookup", &input, &config).await, Some(result.clone()));
        assert_eq!(cache.get("lookup", &input, &json!({"cacheable": "true", "timeout": 9})).await, Some(result));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.writes), (2, 1, 1));
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.hit_rate, 66.67);

        cache.reset_stats();
        assert_eq!(cache.stats().total_requests, 0);
        assert_eq!(cache.stats().hit_rate, 0.0);
    }

    #[tokio::test]
    async fn test_opt_in_required() {
        let cache = cache();
        let input = json!(1);
        let result = ExecutionResult::success(json!(2));

        cache.set("n", &input, &json!({}), &result).await;
        assert!(cache.get("n", &input, &json!({})).await.is_none());
        assert_eq!(cache.stats().writes, 0);
        assert_eq!(cache.stats().misses, 0, "non-cacheable lookups are not counted");

        let disabled = ResultCache::new(
            Arc::new(MemoryStore::new()),
            CacheConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let config = json!({"cacheable": true});
        disabled.set("n", &input, &config, &result).await;
        assert!(disabled.get("n", &input, &config).await.is_none());
        assert!(!disabled.stats().enabled);
    }

    #[tokio::test]
    async fn test_errors_never_cached() {
        let cache = cache();
        let config = json!({"cacheable": true});
        cache
            .set("n", &json!(1), &config, &ExecutionResult::error("503"))
            .await;
        assert_eq!(cache.stats().writes, 0);
        assert!(cache.get("n", &json!(1), &config).await.is_none());
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = ResultCache::new(
            Arc::new(MemoryStore::with_clock(clock.clone())),
            CacheConfig::default(),
        );
        let config = json!({"cacheable": true, "cache_ttl": 60});
        cache
            .set("n", &json!(1), &config, &ExecutionResult::success(json!(1)))
            .await;

        clock.advance(Duration::from_secs(59));
        assert!(cache.get("n", &json!(1), &config).await.is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get("n", &json!(1), &config).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_flush() {
        let cache = cache();
        let config = json!({"cacheable": true});
        let ok = ExecutionResult::success(json!(true));
        for i in 0..3 {
            cache.set("alpha", &json!(i), &config, &ok).await;
        }
        cache.set("beta", &json!(0), &config, &ok).await;
        cache.set("alphabet", &json!(0), &config, &ok).await;

        assert_eq!(cache.invalidate_node_type("alpha").await, 3);
        assert!(cache.get("alphabet", &json!(0), &config).await.is_some());
        assert_eq!(cache.flush().await, 2);
        assert!(cache.get("beta", &json!(0), &config).await.is_none());
    }

    #[tokio::test]
    async fn test_store_outage_is_a_miss() {
        let cache = ResultCache::new(Arc::new(FaultyStore), CacheConfig::default());
        let config = json!({"cacheable": true});
        cache
            .set("n", &json!(1), &config, &ExecutionResult::success(json!(1)))
            .await;
        assert!(cache.get("n", &json!(1), &config).await.is_none());
        assert_eq!(cache.flush().await, 0);

        let stats = cache.stats();
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.store_errors, 3);
    }
}
