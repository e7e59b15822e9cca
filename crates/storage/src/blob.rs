//! Per-space binary blob storage.
//!
//! Blobs are opaque attachments keyed by a content-derived string.
//! Deletion is soft by default; purging actually reclaims space and
//! happens in an explicit `release` pass driven by a caller-supplied
//! set of live references.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, warn};

use common::{BlobEntry, BlobRecord, BlobState, SetBlob};

use crate::connection::Connection;
use crate::error::Result;

/// Store for binary attachments within one space.
#[derive(Clone)]
pub struct BlobStore {
    conn: Arc<Connection>,
}

impl BlobStore {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Upsert a blob: content and metadata are refreshed, and any
    /// earlier soft delete is cleared. Returns the stored size.
    pub async fn set(&self, blob: SetBlob) -> Result<i64> {
        let size = blob.data.len() as i64;
        let created_at = Utc::now().timestamp_millis();
        self.conn
            .with_db(|db| {
                let key = blob.key.clone();
                let data = blob.data.to_vec();
                let mime = blob.mime.clone();
                async move {
                    sqlx::query(
                        r#"
                        INSERT INTO blobs (key, data, mime, size, created_at, deleted_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                        ON CONFLICT (key) DO UPDATE SET
                            data = excluded.data,
                            mime = excluded.mime,
                            size = excluded.size,
                            created_at = excluded.created_at,
                            deleted_at = NULL
                        "#,
                    )
                    .bind(key)
                    .bind(data)
                    .bind(mime)
                    .bind(size)
                    .bind(created_at)
                    .execute(&*db)
                    .await?;
                    Ok(())
                }
            })
            .await
            .map_err(|e| e.into_blob_write(&blob.key))?;

        debug!(key = %blob.key, size, "blob stored");
        Ok(size)
    }

    /// Fetch a blob by key. Missing and soft-deleted blobs both return
    /// `None`; absence is never an error.
    pub async fn get(&self, key: &str) -> Result<Option<BlobRecord>> {
        let row = self
            .conn
            .with_db(|db| {
                let key = key.to_string();
                async move {
                    sqlx::query(
                        r#"
                        SELECT key, data, mime, size, created_at
                        FROM blobs
                        WHERE key = ?1 AND deleted_at IS NULL
                        "#,
                    )
                    .bind(key)
                    .fetch_optional(&*db)
                    .await
                }
            })
            .await?;

        Ok(row.map(|r| BlobRecord {
            key: r.get("key"),
            data: Bytes::from(r.get::<Vec<u8>, _>("data")),
            mime: r.get("mime"),
            size: r.get("size"),
            created_at: DateTime::from_timestamp_millis(r.get::<i64, _>("created_at"))
                .unwrap_or_default(),
        }))
    }

    /// Delete a blob. Soft by default (the row stays for accounting
    /// until `release`); `permanently` removes it outright. Returns
    /// whether anything changed.
    pub async fn delete(&self, key: &str, permanently: bool) -> Result<bool> {
        let affected = self
            .conn
            .with_db(|db| {
                let key = key.to_string();
                let deleted_at = Utc::now().timestamp_millis();
                async move {
                    let result = if permanently {
                        sqlx::query("DELETE FROM blobs WHERE key = ?1")
                            .bind(key)
                            .execute(&*db)
                            .await?
                    } else {
                        sqlx::query(
                            "UPDATE blobs SET deleted_at = ?2 WHERE key = ?1 AND deleted_at IS NULL",
                        )
                        .bind(key)
                        .bind(deleted_at)
                        .execute(&*db)
                        .await?
                    };
                    Ok(result.rows_affected())
                }
            })
            .await?;

        debug!(key = %key, permanently, "blob deleted");
        Ok(affected > 0)
    }

    /// List blob entries. Soft-deleted rows are excluded unless
    /// explicitly requested.
    pub async fn list(&self, include_deleted: bool) -> Result<Vec<BlobEntry>> {
        let rows = self
            .conn
            .with_db(|db| async move {
                sqlx::query(
                    r#"
                    SELECT key, size, created_at, deleted_at
                    FROM blobs
                    WHERE ?1 OR deleted_at IS NULL
                    ORDER BY key ASC
                    "#,
                )
                .bind(include_deleted)
                .fetch_all(&*db)
                .await
            })
            .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let state = match r.get::<Option<i64>, _>("deleted_at") {
                    Some(ms) => BlobState::SoftDeleted {
                        deleted_at: DateTime::from_timestamp_millis(ms).unwrap_or_default(),
                    },
                    None => BlobState::Active,
                };
                BlobEntry {
                    key: r.get("key"),
                    size: r.get("size"),
                    created_at: DateTime::from_timestamp_millis(r.get::<i64, _>("created_at"))
                        .unwrap_or_default(),
                    state,
                }
            })
            .collect())
    }

    /// Total stored bytes, with or without soft-deleted rows. The
    /// difference between the two is the space `release` would reclaim
    /// if nothing were still referenced.
    pub async fn total_size(&self, include_deleted: bool) -> Result<i64> {
        let size = self
            .conn
            .with_db(|db| async move {
                sqlx::query_scalar(
                    r#"
                    SELECT COALESCE(SUM(size), 0)
                    FROM blobs
                    WHERE ?1 OR deleted_at IS NULL
                    "#,
                )
                .bind(include_deleted)
                .fetch_one(&*db)
                .await
            })
            .await?;
        Ok(size)
    }

    /// Garbage-collection pass: purge soft-deleted blobs that are not
    /// in the caller-supplied live set. Reference information is an
    /// explicit external input; this layer never infers it from
    /// document contents. Returns the number of bytes reclaimed.
    pub async fn release(&self, live: &HashSet<String>) -> Result<u64> {
        let candidates = self.list(true).await?;
        let mut reclaimed = 0u64;
        for entry in candidates {
            if !entry.state.is_deleted() || live.contains(&entry.key) {
                continue;
            }
            // Only purge rows still soft-deleted; a blob re-uploaded
            // since the listing stays.
            let purge = self
                .conn
                .with_db(|db| {
                    let key = entry.key.clone();
                    async move {
                        let result = sqlx::query(
                            "DELETE FROM blobs WHERE key = ?1 AND deleted_at IS NOT NULL",
                        )
                        .bind(key)
                        .execute(&*db)
                        .await?;
                        Ok(result.rows_affected())
                    }
                })
                .await;
            match purge {
                Ok(n) if n > 0 => reclaimed += entry.size as u64,
                Ok(_) => {}
                Err(e) => {
                    // Keep collecting; a stuck row is retried next pass.
                    warn!(key = %entry.key, error = %e, "failed to purge blob");
                }
            }
        }
        debug!(reclaimed, "blob release pass complete");
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{SpaceId, SpaceType};

    async fn test_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let id = SpaceId::new("device-a", SpaceType::Workspace, "ws-1").unwrap();
        let conn = Arc::new(Connection::new(&id, dir.path().join("storage.db")));
        conn.connect().await.unwrap();
        (dir, BlobStore::new(conn))
    }

    fn blob(key: &str, data: &'static [u8]) -> SetBlob {
        SetBlob {
            key: key.to_string(),
            data: Bytes::from_static(data),
            mime: "application/octet-stream".to_string(),
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_dir, store) = test_store().await;
        store.set(blob("k1", b"hello blob")).await.unwrap();

        let got = store.get("k1").await.unwrap().unwrap();
        assert_eq!(got.data.as_ref(), b"hello blob");
        assert_eq!(got.mime, "application/octet-stream");
        assert_eq!(got.size, 10);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_dir, store) = test_store().await;
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_is_upsert() {
        let (_dir, store) = test_store().await;
        store.set(blob("k1", b"one")).await.unwrap();
        store.set(blob("k1", b"second")).await.unwrap();

        let got = store.get("k1").await.unwrap().unwrap();
        assert_eq!(got.data.as_ref(), b"second");

        let entries = store.list(true).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_but_accounts() {
        let (_dir, store) = test_store().await;
        store.set(blob("k1", b"payload")).await.unwrap();
        assert!(store.delete("k1", false).await.unwrap());

        // Hidden from reads and the default listing...
        assert!(store.get("k1").await.unwrap().is_none());
        assert!(store.list(false).await.unwrap().is_empty());

        // ...but still accounted for until release.
        let entries = store.list(true).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].state.is_deleted());
        assert_eq!(store.total_size(true).await.unwrap(), 7);
        assert_eq!(store.total_size(false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_clears_soft_delete() {
        let (_dir, store) = test_store().await;
        store.set(blob("k1", b"v1")).await.unwrap();
        store.delete("k1", false).await.unwrap();
        store.set(blob("k1", b"v2")).await.unwrap();

        let got = store.get("k1").await.unwrap().unwrap();
        assert_eq!(got.data.as_ref(), b"v2");
    }

    #[tokio::test]
    async fn test_permanent_delete_removes_row() {
        let (_dir, store) = test_store().await;
        store.set(blob("k1", b"gone")).await.unwrap();
        assert!(store.delete("k1", true).await.unwrap());

        assert!(store.get("k1").await.unwrap().is_none());
        assert!(store.list(true).await.unwrap().is_empty());
        // A second delete finds nothing.
        assert!(!store.delete("k1", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_purges_unreferenced_only() {
        let (_dir, store) = test_store().await;
        store.set(blob("kept", b"still referenced")).await.unwrap();
        store.set(blob("dead", b"orphaned")).await.unwrap();
        store.set(blob("live", b"active")).await.unwrap();
        store.delete("kept", false).await.unwrap();
        store.delete("dead", false).await.unwrap();

        let live: HashSet<String> = ["kept".to_string()].into_iter().collect();
        let reclaimed = store.release(&live).await.unwrap();
        assert_eq!(reclaimed, 8);

        let entries = store.list(true).await.unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        // "dead" purged; "kept" survives soft-deleted; "live" untouched.
        assert_eq!(keys, vec!["kept", "live"]);
    }
}
