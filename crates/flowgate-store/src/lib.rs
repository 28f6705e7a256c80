//! Backing stores for circuit records, cache entries, heartbeats, and run queues.
//!
//! `MemoryStore` serves a single process. `SqliteStore` lets every worker
//! on a host share one database file.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Absolute expiry for a TTL, or `None` when it does not fit the calendar.
pub(crate) fn deadline(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}
