//! Persistence layer for manuscript-dl
//!
//! Handles SQLite persistence for the manifest cache.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`manifests`] — Manifest cache entries (get / put / invalidate)

use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

mod manifests;
mod migrations;

pub use manifests::ENTRY_SCHEMA_VERSION;

/// SQLite-backed manifest cache
///
/// Each cached manifest is one row keyed by a hash of its normalized source
/// URL, carrying its own schema version and corruption flag so one bad entry
/// never takes out the rest of the cache.
#[derive(Debug)]
pub struct Database {
    pool: SqlitePool,
    // Per-key async locks: same-key operations serialize, different keys
    // proceed in parallel
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Database {
    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        // Evict locks no in-flight operation holds (map entry is the only
        // remaining Arc), so the map tracks live keys rather than every key
        // ever seen
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    async fn key_lock_count(&self) -> usize {
        self.key_locks.lock().await.len()
    }
}
