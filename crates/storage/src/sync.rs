//! Sync clock bookkeeping for one space.
//!
//! For every remote peer the sync protocol tracks three independent
//! classes of logical clocks per document:
//!
//! - *remote*: the last update timestamp the peer advertised,
//! - *pulled*: the last peer update actually applied locally,
//! - *pushed*: the last local update already sent to the peer.
//!
//! Every write is a monotonic max performed inside SQLite, so
//! out-of-order calls from multiple tabs or processes can never move a
//! clock backwards. After a successful sync cycle
//! `pulled <= remote` holds for every `(peer, doc)` pair.

use std::sync::Arc;

use chrono::DateTime;
use sqlx::Row;
use tracing::debug;

use common::DocClock;

use crate::connection::Connection;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockKind {
    Remote,
    Pulled,
    Pushed,
}

impl ClockKind {
    fn table(&self) -> &'static str {
        match self {
            ClockKind::Remote => "remote_clocks",
            ClockKind::Pulled => "pulled_clocks",
            ClockKind::Pushed => "pushed_clocks",
        }
    }
}

/// Store for per-peer synchronization clocks within one space.
#[derive(Clone)]
pub struct SyncStore {
    conn: Arc<Connection>,
}

impl SyncStore {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    // Remote clocks: what a peer says it has.

    pub async fn get_peer_remote_clock(
        &self,
        peer: &str,
        doc_id: &str,
    ) -> Result<Option<DocClock>> {
        self.get_clock(ClockKind::Remote, peer, doc_id).await
    }

    pub async fn get_peer_remote_clocks(&self, peer: &str) -> Result<Vec<DocClock>> {
        self.get_clocks(ClockKind::Remote, peer).await
    }

    pub async fn set_peer_remote_clock(&self, peer: &str, clock: &DocClock) -> Result<()> {
        self.set_clock(ClockKind::Remote, peer, clock).await
    }

    // Pulled clocks: what we have actually applied from a peer.

    pub async fn get_peer_pulled_clock(
        &self,
        peer: &str,
        doc_id: &str,
    ) -> Result<Option<DocClock>> {
        self.get_clock(ClockKind::Pulled, peer, doc_id).await
    }

    pub async fn get_peer_pulled_clocks(&self, peer: &str) -> Result<Vec<DocClock>> {
        self.get_clocks(ClockKind::Pulled, peer).await
    }

    pub async fn set_peer_pulled_clock(&self, peer: &str, clock: &DocClock) -> Result<()> {
        self.set_clock(ClockKind::Pulled, peer, clock).await
    }

    // Pushed clocks: what we have already sent to a peer.

    pub async fn get_peer_pushed_clock(
        &self,
        peer: &str,
        doc_id: &str,
    ) -> Result<Option<DocClock>> {
        self.get_clock(ClockKind::Pushed, peer, doc_id).await
    }

    pub async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<Vec<DocClock>> {
        self.get_clocks(ClockKind::Pushed, peer).await
    }

    pub async fn set_peer_pushed_clock(&self, peer: &str, clock: &DocClock) -> Result<()> {
        self.set_clock(ClockKind::Pushed, peer, clock).await
    }

    /// Wipe all clock tables for this space.
    ///
    /// Only ever invoked explicitly by the caller when re-bootstrapping
    /// sync state; the storage layer never infers a wipe on its own.
    pub async fn clear_clocks(&self) -> Result<()> {
        self.conn
            .with_db(|db| async move {
                for kind in [ClockKind::Remote, ClockKind::Pulled, ClockKind::Pushed] {
                    sqlx::query(&format!("DELETE FROM {}", kind.table()))
                        .execute(&*db)
                        .await?;
                }
                Ok(())
            })
            .await?;
        debug!("sync clocks cleared");
        Ok(())
    }

    async fn get_clock(
        &self,
        kind: ClockKind,
        peer: &str,
        doc_id: &str,
    ) -> Result<Option<DocClock>> {
        let millis: Option<i64> = self
            .conn
            .with_db(|db| {
                let peer = peer.to_string();
                let doc_id = doc_id.to_string();
                let sql = format!(
                    "SELECT timestamp FROM {} WHERE peer = ?1 AND doc_id = ?2",
                    kind.table()
                );
                async move {
                    sqlx::query_scalar(&sql)
                        .bind(peer)
                        .bind(doc_id)
                        .fetch_optional(&*db)
                        .await
                }
            })
            .await?;
        Ok(millis
            .and_then(DateTime::from_timestamp_millis)
            .map(|t| DocClock::new(doc_id, t)))
    }

    async fn get_clocks(&self, kind: ClockKind, peer: &str) -> Result<Vec<DocClock>> {
        let rows = self
            .conn
            .with_db(|db| {
                let peer = peer.to_string();
                let sql = format!(
                    "SELECT doc_id, timestamp FROM {} WHERE peer = ?1 ORDER BY doc_id ASC",
                    kind.table()
                );
                async move { sqlx::query(&sql).bind(peer).fetch_all(&*db).await }
            })
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let ts = DateTime::from_timestamp_millis(row.get::<i64, _>("timestamp"))?;
                Some(DocClock::new(row.get::<String, _>("doc_id"), ts))
            })
            .collect())
    }

    /// Monotonic max: an incoming timestamp at or below the stored one
    /// is a no-op, making clock writes commutative under any
    /// interleaving of concurrent callers.
    async fn set_clock(&self, kind: ClockKind, peer: &str, clock: &DocClock) -> Result<()> {
        let millis = clock.timestamp.timestamp_millis();
        self.conn
            .with_db(|db| {
                let peer = peer.to_string();
                let doc_id = clock.doc_id.clone();
                let table = kind.table();
                let sql = format!(
                    r#"
                    INSERT INTO {table} (peer, doc_id, timestamp)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT (peer, doc_id) DO UPDATE SET
                        timestamp = excluded.timestamp
                    WHERE excluded.timestamp > {table}.timestamp
                    "#
                );
                async move {
                    sqlx::query(&sql)
                        .bind(peer)
                        .bind(doc_id)
                        .bind(millis)
                        .execute(&*db)
                        .await?;
                    Ok(())
                }
            })
            .await
    }
}
