use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use flowgate_core::clock::{Clock, SystemClock};
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::{KvStore, QueueStore};

use crate::deadline;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS queue_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        item TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_queue_items ON queue_items(queue, id);";

/// SQLite-backed store. Expiry is stored as epoch milliseconds and
/// filtered on read; writers take an immediate transaction so that
/// compare-and-swap holds across processes sharing the file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

fn db_err(e: rusqlite::Error) -> FlowgateError {
    FlowgateError::Store(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowgateError::Store(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowgateError::Store(e.to_string()))
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expiry_ms(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.and_then(|t| deadline(self.clock.now(), t))
            .map(|at| at.timestamp_millis())
    }
}

fn live_value(conn: &Connection, key: &str, now: i64) -> rusqlite::Result<Option<(String, Option<i64>)>> {
    conn.query_row(
        "SELECT value, expires_at FROM kv
         WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        params![key, now],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
}

fn upsert(conn: &Connection, key: &str, value: &str, expires_at: Option<i64>) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        params![key, value, expires_at],
    )
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let found = live_value(&conn, &key, self.now_ms()).map_err(db_err)?;
            Ok(found.map(|(value, _)| value))
        })
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let expires_at = self.expiry_ms(ttl);
            let conn = self.lock()?;
            upsert(&conn, &key, &value, expires_at).map_err(db_err)?;
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
            let now = self.now_ms();
            let expires_at = self.expiry_ms(ttl);
            let mut conn = self.lock()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;

            let current = live_value(&tx, &key, now).map_err(db_err)?.map(|(v, _)| v);
            if current != expected {
                return Ok(false);
            }
            match new {
                Some(value) => {
                    upsert(&tx, &key, &value, expires_at).map_err(db_err)?;
                }
                None => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])
                        .map_err(db_err)?;
                }
            }
            tx.commit().map_err(db_err)?;
            Ok(true)
        })
    }

    fn incr(&self, key: &str) -> BoxFuture<'_, Result<i64>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = self.now_ms();
            let mut conn = self.lock()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;

            let (current, expires_at) = match live_value(&tx, &key, now).map_err(db_err)? {
                Some((value, expires_at)) => {
                    let n: i64 = value.parse().map_err(|_| {
                        FlowgateError::Store(format!("value at '{}' is not an integer", key))
                    })?;
                    (n, expires_at)
                }
                None => (0, None),
            };
            let next = current + 1;
            upsert(&tx, &key, &next.to_string(), expires_at).map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(next)
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = self.now_ms();
            let conn = self.lock()?;
            let existed = live_value(&conn, &key, now).map_err(db_err)?.is_some();
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(db_err)?;
            Ok(existed)
        })
    }

    fn scan_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT key FROM kv
                     WHERE substr(key, 1, length(?1)) = ?1
                       AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY key",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![prefix, self.now_ms()], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(db_err)?);
            }
            Ok(keys)
        })
    }

    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = self.now_ms();
            let expires_at = self.expiry_ms(Some(ttl));
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE kv SET expires_at = ?2
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)",
                    params![key, expires_at, now],
                )
                .map_err(db_err)?;
            Ok(changed > 0)
        })
    }

    fn purge_expired(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let now = self.now_ms();
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
            .map_err(db_err)
        })
    }
}

impl QueueStore for SqliteStore {
    fn push(&self, queue: &str, item: String) -> BoxFuture<'_, Result<()>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO queue_items (queue, item) VALUES (?1, ?2)",
                params![queue, item],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn pop(&self, queue: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            let head: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, item FROM queue_items WHERE queue = ?1 ORDER BY id LIMIT 1",
                    params![queue],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            let Some((id, item)) = head else {
                return Ok(None);
            };
            tx.execute("DELETE FROM queue_items WHERE id = ?1", params![id])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(Some(item))
        })
    }

    fn len(&self, queue: &str) -> BoxFuture<'_, Result<u64>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM queue_items WHERE queue = ?1",
                    params![queue],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count.max(0) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_test_utils::ManualClock;

    #[tokio::test]
    async fn test_kv_roundtrip_and_ttl() {
        let clock = Arc::new(ManualClock::new());
        let store = SqliteStore::in_memory().unwrap().with_clock(clock.clone());

        store.set("a", "1".into(), None).await.unwrap();
        store
            .set("b", "2".into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.scan_prefix("").await.unwrap(), vec!["a", "b"]);

        clock.advance(Duration::from_secs(11));
        assert!(store.get("b").await.unwrap().is_none());
        assert_eq!(store.scan_prefix("").await.unwrap(), vec!["a"]);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_compare_and_swap_and_incr() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.compare_and_swap("c", None, Some("x".into()), None).await.unwrap());
        assert!(!store.compare_and_swap("c", Some("y"), Some("z".into()), None).await.unwrap());
        assert!(store.compare_and_swap("c", Some("x"), None, None).await.unwrap());
        assert!(store.get("c").await.unwrap().is_none());

        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        assert!(store.delete("n").await.unwrap());
        assert!(!store.delete("n").await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.push("runs", "one".into()).await.unwrap();
            store.push("runs", "two".into()).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.len("runs").await.unwrap(), 2);
        assert_eq!(store.pop("runs").await.unwrap().as_deref(), Some("one"));
        assert_eq!(store.len("runs").await.unwrap(), 1);
        assert!(store.pop("empty").await.unwrap().is_none());
    }
}
