//! SQLite database handle for one workspace.
//!
//! Each space owns exactly one database file; this module manages its
//! connection pool, schema migrations, WAL checkpointing, and the
//! structural validation used by the import/export boundary. All tables
//! live in the same file so a checkpointed copy is self-consistent.

use std::io::Read;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::{Result, StorageError};

/// First 16 bytes of every valid SQLite database file.
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Connection pool for one space's database file.
#[derive(Debug, Clone)]
pub struct SpaceDb {
    pool: SqlitePool,
}

impl std::ops::Deref for SpaceDb {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl SpaceDb {
    /// Open (or create) the database file at `path`.
    ///
    /// Parent directories are created as needed. An existing file that
    /// fails the structural header check is refused with `CorruptStore`;
    /// every other open failure, including a lock held by another
    /// process, surfaces as `StorageUnavailable`. Migrations run before
    /// the handle is returned.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::StorageUnavailable(format!(
                    "failed to create storage directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        Self::validate_file(path)?;

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                StorageError::StorageUnavailable(format!(
                    "failed to open {}: {e}",
                    path.display()
                ))
            })?;

        let db = Self { pool };
        db.run_migrations().await.map_err(|e| {
            StorageError::StorageUnavailable(format!(
                "failed to initialize schema in {}: {e}",
                path.display()
            ))
        })?;

        debug!(path = %path.display(), "space database ready");
        Ok(db)
    }

    /// Create an in-memory database. Test and tooling use only.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                StorageError::StorageUnavailable(format!("failed to open in-memory db: {e}"))
            })?;

        let db = Self { pool };
        db.run_migrations().await.map_err(|e| {
            StorageError::StorageUnavailable(format!("failed to initialize schema: {e}"))
        })?;
        Ok(db)
    }

    /// Check the structural header of a database file without opening a
    /// pool.
    ///
    /// A missing or zero-length file is fine (SQLite initializes it on
    /// first write); anything else must start with the SQLite magic.
    /// This is the validation hook the external "load" path calls before
    /// treating a copied file as a valid store.
    pub fn validate_file(path: &Path) -> Result<()> {
        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::StorageUnavailable(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        let mut header = [0u8; 16];
        let mut read = 0;
        while read < header.len() {
            match file.read(&mut header[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) => {
                    return Err(StorageError::StorageUnavailable(format!(
                        "failed to read {}: {e}",
                        path.display()
                    )))
                }
            }
        }

        if read == 0 {
            // empty file, SQLite will initialize it
            return Ok(());
        }
        if read < header.len() || header != *SQLITE_MAGIC {
            return Err(StorageError::CorruptStore(format!(
                "{} is not a valid store file",
                path.display()
            )));
        }
        Ok(())
    }

    /// Run schema migrations. Idempotent.
    async fn run_migrations(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_updates_doc_id
            ON updates(doc_id, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                mime TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for table in ["remote_clocks", "pulled_clocks", "pushed_clocks"] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    peer TEXT NOT NULL,
                    doc_id TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    PRIMARY KEY (peer, doc_id)
                )
                "#
            ))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Flush the write-ahead log into the main database file.
    ///
    /// Required before any external copy of the file (export, backup).
    /// Safe to call concurrently with reads and writes; SQLite's own
    /// locking arbitrates with in-flight statements.
    pub async fn checkpoint(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = SpaceDb::in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM updates")
            .fetch_one(&*db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = SpaceDb::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer-a").join("ws-1").join("storage.db");
        let db = SpaceDb::open(&path).await.unwrap();
        assert!(path.exists());
        db.close().await;
    }

    #[tokio::test]
    async fn test_rejects_non_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.db");
        std::fs::write(&path, b"definitely not a database file").unwrap();

        let err = SpaceDb::open(&path).await.unwrap_err();
        assert!(matches!(err, StorageError::CorruptStore(_)));
    }

    #[tokio::test]
    async fn test_empty_file_is_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.db");
        std::fs::write(&path, b"").unwrap();

        let db = SpaceDb::open(&path).await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_checkpoint_flushes_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.db");
        let db = SpaceDb::open(&path).await.unwrap();

        sqlx::query("INSERT INTO updates (doc_id, data, created_at) VALUES ('d', x'00', 1)")
            .execute(&*db)
            .await
            .unwrap();
        db.checkpoint().await.unwrap();

        // After a TRUNCATE checkpoint every committed write lives in the
        // main file; a raw copy of it must see the row.
        let copy = dir.path().join("copy.db");
        std::fs::copy(&path, &copy).unwrap();
        let copied = SpaceDb::open(&copy).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM updates")
            .fetch_one(&*copied)
            .await
            .unwrap();
        assert_eq!(count, 1);

        copied.close().await;
        db.close().await;
    }
}
