//! Manifest cache entries: get, put, invalidate.
//!
//! Every operation is scoped to one row. Corruption is isolated per entry: a
//! payload that no longer deserializes, carries the wrong entry version, or
//! was explicitly invalidated reads back as a miss, and the caller re-resolves
//! that one manifest while the rest of the cache stays intact.

use crate::error::CacheError;
use crate::types::Manifest;
use crate::{Error, Result};
use sha2::{Digest, Sha256};

use super::Database;

/// Version stamped on every cache entry.
///
/// Bump this when the serialized [`Manifest`] shape changes; entries written
/// under an older version read back as misses and get re-resolved, with no
/// database-wide migration needed.
pub const ENTRY_SCHEMA_VERSION: i64 = 1;

impl Database {
    /// Cache key for a source URL: SHA-256 of the trimmed, lowercased URL
    pub(crate) fn cache_key(url: &str) -> String {
        let normalized = url.trim().to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a cached manifest.
    ///
    /// Returns `None` for anything unusable: missing entries, entries flagged
    /// corrupted, entries written under a different [`ENTRY_SCHEMA_VERSION`],
    /// payloads that fail to deserialize, and zero-page manifests. Unusable
    /// payloads are flagged corrupted in place so they are not re-parsed on
    /// every lookup.
    pub async fn get_manifest(&self, url: &str) -> Result<Option<Manifest>> {
        let key = Self::cache_key(url);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let row: Option<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT payload, schema_version, corrupted FROM manifests WHERE key = ?
            "#,
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Cache(CacheError::QueryFailed(format!(
                "Failed to read cache entry: {}",
                e
            )))
        })?;

        let Some((payload, schema_version, corrupted)) = row else {
            return Ok(None);
        };
        if corrupted != 0 {
            tracing::debug!(url, "cache entry is flagged corrupted, treating as miss");
            return Ok(None);
        }
        if schema_version != ENTRY_SCHEMA_VERSION {
            tracing::debug!(
                url,
                entry_version = schema_version,
                expected = ENTRY_SCHEMA_VERSION,
                "cache entry has a stale schema version, treating as miss"
            );
            return Ok(None);
        }

        match serde_json::from_str::<Manifest>(&payload) {
            Ok(manifest) if !manifest.pages.is_empty() => Ok(Some(manifest)),
            Ok(_) => {
                tracing::warn!(url, "cached manifest has zero pages, flagging as corrupted");
                self.flag_corrupted(&key).await;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(
                    url,
                    error = %e,
                    "cached manifest failed to deserialize, flagging as corrupted"
                );
                self.flag_corrupted(&key).await;
                Ok(None)
            }
        }
    }

    /// Insert or replace a cache entry.
    ///
    /// Zero-page manifests are refused; they are resolution failures, not
    /// cacheable values. Writing a key clears any corruption flag it carried.
    pub async fn put_manifest(&self, manifest: &Manifest) -> Result<()> {
        if manifest.pages.is_empty() {
            return Err(Error::EmptyManifest {
                url: manifest.source_url.clone(),
            });
        }

        let key = Self::cache_key(&manifest.source_url);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let payload = serde_json::to_string(manifest)?;

        sqlx::query(
            r#"
            INSERT INTO manifests (key, source_url, payload, schema_version, corrupted, resolved_at)
            VALUES (?, ?, ?, ?, 0, ?)
            ON CONFLICT(key) DO UPDATE SET
                source_url = excluded.source_url,
                payload = excluded.payload,
                schema_version = excluded.schema_version,
                corrupted = 0,
                resolved_at = excluded.resolved_at
            "#,
        )
        .bind(&key)
        .bind(&manifest.source_url)
        .bind(&payload)
        .bind(ENTRY_SCHEMA_VERSION)
        .bind(manifest.resolved_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Cache(CacheError::QueryFailed(format!(
                "Failed to write cache entry: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Invalidate exactly one entry by flagging it corrupted.
    ///
    /// Touches nothing but that row; other entries and the shared schema
    /// marker are unaffected. Returns whether an entry existed.
    pub async fn invalidate_manifest(&self, url: &str) -> Result<bool> {
        let key = Self::cache_key(url);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let result = sqlx::query("UPDATE manifests SET corrupted = 1 WHERE key = ?")
            .bind(&key)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Cache(CacheError::QueryFailed(format!(
                    "Failed to invalidate cache entry: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    // Best-effort: a failure to flag leaves the entry to be re-flagged on the
    // next lookup
    async fn flag_corrupted(&self, key: &str) {
        if let Err(e) = sqlx::query("UPDATE manifests SET corrupted = 1 WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %e, "failed to flag corrupted cache entry");
        }
    }
}
