//! Per-space document update storage.
//!
//! A document's durable state is the ordered append of its binary CRDT
//! updates. Writes never rewrite history; reads materialize the latest
//! snapshot by replaying every stored update through the CRDT library.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, warn};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use common::{DocClock, DocUpdate};

use crate::connection::Connection;
use crate::error::Result;

/// Store for CRDT document updates within one space.
#[derive(Clone)]
pub struct DocStore {
    conn: Arc<Connection>,
}

impl DocStore {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Append one update to a document's history.
    ///
    /// Append-only: prior updates are never overwritten. Returns the
    /// timestamp the update was accepted at. The row either commits
    /// whole or not at all; a failed write surfaces as
    /// `FailedToSaveUpdates`.
    pub async fn push_update(&self, update: DocUpdate) -> Result<DateTime<Utc>> {
        let timestamp = Utc::now();
        let millis = timestamp.timestamp_millis();
        self.conn
            .with_db(|db| {
                let doc_id = update.doc_id.clone();
                let data = update.bin.to_vec();
                async move {
                    sqlx::query(
                        "INSERT INTO updates (doc_id, data, created_at) VALUES (?1, ?2, ?3)",
                    )
                    .bind(doc_id)
                    .bind(data)
                    .bind(millis)
                    .execute(&*db)
                    .await?;
                    Ok(())
                }
            })
            .await
            .map_err(|e| e.into_doc_write())?;

        debug!(doc_id = %update.doc_id, size = update.bin.len(), "doc update stored");
        Ok(timestamp)
    }

    /// Materialize the latest state of a document by merging all stored
    /// updates, oldest first. Returns `None` when the doc has no
    /// updates (never existed, or was deleted).
    ///
    /// Updates that fail to decode are skipped with a warning rather
    /// than poisoning the whole document.
    pub async fn get_doc(&self, doc_id: &str) -> Result<Option<Bytes>> {
        let rows: Vec<Vec<u8>> = self
            .conn
            .with_db(|db| {
                let doc_id = doc_id.to_string();
                async move {
                    sqlx::query_scalar(
                        "SELECT data FROM updates WHERE doc_id = ?1 ORDER BY id ASC",
                    )
                    .bind(doc_id)
                    .fetch_all(&*db)
                    .await
                }
            })
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for bin in &rows {
                match Update::decode_v1(bin) {
                    Ok(update) => {
                        if let Err(e) = txn.apply_update(update) {
                            warn!(doc_id = %doc_id, error = %e, "skipping unappliable update");
                        }
                    }
                    Err(e) => {
                        warn!(doc_id = %doc_id, error = %e, "skipping malformed update");
                    }
                }
            }
        }
        let state = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        Ok(Some(Bytes::from(state)))
    }

    /// Remove every update row for a document. Irreversible.
    pub async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        let removed = self
            .conn
            .with_db(|db| {
                let doc_id = doc_id.to_string();
                async move {
                    let result = sqlx::query("DELETE FROM updates WHERE doc_id = ?1")
                        .bind(doc_id)
                        .execute(&*db)
                        .await?;
                    Ok(result.rows_affected())
                }
            })
            .await?;
        debug!(doc_id = %doc_id, removed, "doc deleted");
        Ok(())
    }

    /// Last-modified timestamp of one document, or `None` if absent.
    pub async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = self
            .conn
            .with_db(|db| {
                let doc_id = doc_id.to_string();
                async move {
                    sqlx::query_scalar(
                        "SELECT MAX(created_at) FROM updates WHERE doc_id = ?1",
                    )
                    .bind(doc_id)
                    .fetch_one(&*db)
                    .await
                }
            })
            .await?;
        Ok(millis.and_then(DateTime::from_timestamp_millis))
    }

    /// Latest timestamp per document, optionally restricted to docs
    /// modified strictly after `after`. Drives the push side of sync.
    pub async fn get_doc_timestamps(
        &self,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<DocClock>> {
        let cursor = after.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let rows = self
            .conn
            .with_db(|db| async move {
                sqlx::query(
                    r#"
                    SELECT doc_id, MAX(created_at) AS ts
                    FROM updates
                    GROUP BY doc_id
                    HAVING ts > ?1
                    ORDER BY doc_id ASC
                    "#,
                )
                .bind(cursor)
                .fetch_all(&*db)
                .await
            })
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let ts = DateTime::from_timestamp_millis(row.get::<i64, _>("ts"))?;
                Some(DocClock::new(row.get::<String, _>("doc_id"), ts))
            })
            .collect())
    }

    /// Number of stored update rows for a document. Callers use this to
    /// decide when a history is worth squashing.
    pub async fn update_count(&self, doc_id: &str) -> Result<i64> {
        let count = self
            .conn
            .with_db(|db| {
                let doc_id = doc_id.to_string();
                async move {
                    sqlx::query_scalar("SELECT COUNT(*) FROM updates WHERE doc_id = ?1")
                        .bind(doc_id)
                        .fetch_one(&*db)
                        .await
                }
            })
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{SpaceId, SpaceType};
    use yrs::{GetString, Text};

    async fn test_store() -> (tempfile::TempDir, DocStore) {
        let dir = tempfile::tempdir().unwrap();
        let id = SpaceId::new("device-a", SpaceType::Workspace, "ws-1").unwrap();
        let conn = Arc::new(Connection::new(&id, dir.path().join("storage.db")));
        conn.connect().await.unwrap();
        (dir, DocStore::new(conn))
    }

    /// Build two sequential text updates ("A" then "B") for a doc.
    fn two_updates() -> (Vec<u8>, Vec<u8>) {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        let u1 = {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, "A");
            txn.encode_update_v1()
        };
        let u2 = {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 1, "B");
            txn.encode_update_v1()
        };
        (u1, u2)
    }

    fn materialized_text(state: &[u8]) -> String {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        }
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[tokio::test]
    async fn test_push_then_get_merges_history() {
        let (_dir, store) = test_store().await;
        let (u1, u2) = two_updates();

        let t1 = store
            .push_update(DocUpdate::new("doc1", u1))
            .await
            .unwrap();
        let t2 = store
            .push_update(DocUpdate::new("doc1", u2))
            .await
            .unwrap();
        assert!(t2 >= t1);

        let state = store.get_doc("doc1").await.unwrap().unwrap();
        // The merge of both updates, not just the last one.
        assert_eq!(materialized_text(&state), "AB");
    }

    #[tokio::test]
    async fn test_get_absent_doc_is_none() {
        let (_dir, store) = test_store().await;
        assert!(store.get_doc("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_doc_removes_history() {
        let (_dir, store) = test_store().await;
        let (u1, _) = two_updates();
        store.push_update(DocUpdate::new("doc1", u1)).await.unwrap();

        store.delete_doc("doc1").await.unwrap();
        assert!(store.get_doc("doc1").await.unwrap().is_none());
        assert!(store.get_doc_timestamp("doc1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_update_is_skipped() {
        let (_dir, store) = test_store().await;
        let (u1, _) = two_updates();
        store.push_update(DocUpdate::new("doc1", u1)).await.unwrap();
        store
            .push_update(DocUpdate::new("doc1", &b"garbage"[..]))
            .await
            .unwrap();

        let state = store.get_doc("doc1").await.unwrap().unwrap();
        assert_eq!(materialized_text(&state), "A");
    }

    #[tokio::test]
    async fn test_doc_timestamp_is_latest() {
        let (_dir, store) = test_store().await;
        let (u1, u2) = two_updates();
        store.push_update(DocUpdate::new("doc1", u1)).await.unwrap();
        let t2 = store
            .push_update(DocUpdate::new("doc1", u2))
            .await
            .unwrap();

        let got = store.get_doc_timestamp("doc1").await.unwrap().unwrap();
        assert_eq!(got.timestamp_millis(), t2.timestamp_millis());
    }

    #[tokio::test]
    async fn test_doc_timestamps_filter_by_cursor() {
        let (_dir, store) = test_store().await;
        let (u1, u2) = two_updates();
        let t1 = store
            .push_update(DocUpdate::new("doc1", u1))
            .await
            .unwrap();
        store.push_update(DocUpdate::new("doc2", u2)).await.unwrap();

        let all = store.get_doc_timestamps(None).await.unwrap();
        assert_eq!(all.len(), 2);

        // Strictly-after semantics: a cursor at doc1's timestamp only
        // returns docs modified later.
        let after = store.get_doc_timestamps(Some(t1)).await.unwrap();
        assert!(after.iter().all(|c| c.timestamp > t1));
    }

    #[tokio::test]
    async fn test_update_count() {
        let (_dir, store) = test_store().await;
        let (u1, u2) = two_updates();
        assert_eq!(store.update_count("doc1").await.unwrap(), 0);
        store.push_update(DocUpdate::new("doc1", u1)).await.unwrap();
        store.push_update(DocUpdate::new("doc1", u2)).await.unwrap();
        assert_eq!(store.update_count("doc1").await.unwrap(), 2);
    }
}
