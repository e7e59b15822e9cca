//! Connection lifecycle for a space's database handle.
//!
//! Exactly one physical handle exists per space within a process; the
//! doc, blob, and sync stores all share it through [`ConnectionShare`]
//! and re-resolve the current handle on every call instead of caching
//! it. A dropped connection is re-established transparently on the next
//! operation, with at most one retry per call.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use common::SpaceId;

use crate::db::SpaceDb;
use crate::error::{Result, StorageError};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Closing => "closing",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One status transition, broadcast to subscribers.
///
/// Delivery is at-least-once per transition; subscribers that lag are
/// skipped ahead, and the connection never blocks on them.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

/// The single physical handle to one space's database.
///
/// Stores never hold the inner [`SpaceDb`]; they go through
/// [`Connection::with_db`] so every call observes the current handle
/// and picks up reconnects.
#[derive(Debug)]
pub struct Connection {
    /// Universal id of the space, used as share key and in logs.
    key: String,
    path: PathBuf,
    state: Mutex<ConnectionStatus>,
    db: Mutex<Option<SpaceDb>>,
    /// Serializes connect/disconnect; never held across store calls.
    transition: tokio::sync::Mutex<()>,
    events: broadcast::Sender<StatusEvent>,
}

impl Connection {
    pub fn new(id: &SpaceId, db_path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            key: id.to_string(),
            path: db_path,
            state: Mutex::new(ConnectionStatus::Idle),
            db: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.state.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Open the backing file, creating it (and parent directories) if
    /// absent. Idempotent: a connected connection is left untouched.
    ///
    /// Fails fast with `StorageUnavailable` on a single failed attempt;
    /// retrying is the caller's (or the auto-reconnect path's) concern.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        if self.status() == ConnectionStatus::Connected && self.db.lock().is_some() {
            return Ok(());
        }

        self.set_status(ConnectionStatus::Connecting, None);

        // Drop any stale handle left over from an errored connection.
        let stale = self.db.lock().take();
        if let Some(old) = stale {
            old.close().await;
        }

        match SpaceDb::open(&self.path).await {
            Ok(db) => {
                *self.db.lock() = Some(db);
                self.set_status(ConnectionStatus::Connected, None);
                debug!(key = %self.key, "space connection established");
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Error, Some(e.to_string()));
                warn!(key = %self.key, error = %e, "failed to connect space storage");
                Err(e)
            }
        }
    }

    /// Best-effort close. Never fails; teardown must not blow up
    /// unrelated cleanup code.
    pub async fn disconnect(&self) {
        let _guard = self.transition.lock().await;
        self.set_status(ConnectionStatus::Closing, None);
        if let Some(db) = self.db.lock().take() {
            db.close().await;
        }
        self.set_status(ConnectionStatus::Closed, None);
        debug!(key = %self.key, "space connection closed");
    }

    /// Flush the WAL into the main file so it can be copied externally.
    pub async fn checkpoint(&self) -> Result<()> {
        self.with_db(|db| async move { db.checkpoint().await }).await
    }

    /// Run one engine operation against the current handle.
    ///
    /// If the operation fails because the connection dropped, the
    /// connection transitions to `Error` and the operation is replayed
    /// once against a freshly connected handle. A second consecutive
    /// failure surfaces to the caller.
    pub(crate) async fn with_db<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(SpaceDb) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let db = self.acquire().await?;
        match op(db).await {
            Ok(value) => Ok(value),
            Err(e) if is_connection_lost(&e) => {
                warn!(key = %self.key, error = %e, "space connection lost, reconnecting");
                self.set_status(ConnectionStatus::Error, Some(e.to_string()));
                let db = self.acquire().await?;
                op(db).await.map_err(StorageError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the current handle, reconnecting if needed.
    async fn acquire(&self) -> Result<SpaceDb> {
        if self.status() == ConnectionStatus::Connected {
            if let Some(db) = self.db.lock().clone() {
                return Ok(db);
            }
        }
        self.connect().await?;
        self.db.lock().clone().ok_or_else(|| {
            StorageError::StorageUnavailable(format!("connection {} has no live handle", self.key))
        })
    }

    fn set_status(&self, status: ConnectionStatus, error: Option<String>) {
        *self.state.lock() = status;
        // No receivers is fine; the stream is purely observational.
        let _ = self.events.send(StatusEvent { status, error });
    }

    #[cfg(test)]
    pub(crate) fn current_db(&self) -> Option<SpaceDb> {
        self.db.lock().clone()
    }
}

/// Errors that mean the physical handle is gone, as opposed to a
/// statement-level failure worth surfacing directly.
fn is_connection_lost(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
    )
}

struct ShareEntry {
    conn: Arc<Connection>,
    refs: usize,
}

/// Process-wide registry handing out shared connections.
///
/// Repeated `share` calls with the same space id return the same
/// underlying [`Connection`]; the instance is torn down only when every
/// holder has released it. The registry is an explicit object so tests
/// (and embedders) can run independent instances side by side.
#[derive(Default)]
pub struct ConnectionShare {
    inner: Mutex<HashMap<String, ShareEntry>>,
}

impl ConnectionShare {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the shared connection for `id`, incrementing its
    /// logical reference count.
    pub fn share(&self, id: &SpaceId, db_path: PathBuf) -> Arc<Connection> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entry(id.to_string())
            .or_insert_with(|| ShareEntry {
                conn: Arc::new(Connection::new(id, db_path)),
                refs: 0,
            });
        entry.refs += 1;
        entry.conn.clone()
    }

    /// Drop one reference; disconnects and evicts at zero. A release
    /// for an unknown id is a no-op.
    pub async fn release(&self, id: &SpaceId) {
        let key = id.to_string();
        let teardown = {
            let mut inner = self.inner.lock();
            match inner.get_mut(&key) {
                Some(entry) => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        inner.remove(&key).map(|e| e.conn)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(conn) = teardown {
            conn.disconnect().await;
        }
    }

    pub fn ref_count(&self, id: &SpaceId) -> usize {
        self.inner
            .lock()
            .get(&id.to_string())
            .map(|e| e.refs)
            .unwrap_or(0)
    }
}
