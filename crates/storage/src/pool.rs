//! Process-wide cache of space storage instances.
//!
//! The pool guarantees at most one live [`SpaceStorage`] per space per
//! pool, with connect-on-demand and explicit disconnect. It is an
//! ordinary object handed around by reference, not a hidden global, so
//! tests run independent pools side by side.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use common::SpaceId;

use crate::connection::{ConnectionShare, ConnectionStatus};
use crate::error::{Result, StorageError};
use crate::space::SpaceStorage;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Root directory for all space file trees
    /// (`<root>/<peer>/<id>/storage.db`).
    pub root: PathBuf,
}

/// One space's status transition, tagged with its identity.
///
/// The stream is multicast: any number of subscribers, at-least-once
/// delivery per transition, no ordering across different spaces.
/// Dropping every receiver never affects the stores themselves.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub space: SpaceId,
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

/// Registry of live space storage instances.
pub struct StoragePool {
    config: PoolConfig,
    shares: Arc<ConnectionShare>,
    entries: Mutex<HashMap<String, Arc<SpaceStorage>>>,
    events: broadcast::Sender<PoolEvent>,
}

impl StoragePool {
    pub fn new(config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            shares: Arc::new(ConnectionShare::new()),
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to the pool's status stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Return the cached storage for `id`, creating and connecting a
    /// new one if absent. A failed connect is not cached; the entry is
    /// re-creatable on the next call.
    pub async fn ensure(&self, id: &SpaceId) -> Result<Arc<SpaceStorage>> {
        if let Some(existing) = self.get(id) {
            return Ok(existing);
        }

        let storage = Arc::new(SpaceStorage::open(
            id.clone(),
            &self.config.root,
            self.shares.clone(),
        ));
        self.spawn_forwarder(id.clone(), &storage);

        if let Err(e) = storage.connect().await {
            storage.destroy().await;
            return Err(e);
        }

        // Another caller may have raced us here; keep the first entry
        // and fold ours back into the share registry.
        let winner = {
            let mut entries = self.entries.lock();
            match entries.get(&id.to_string()) {
                Some(existing) => Some(existing.clone()),
                None => {
                    entries.insert(id.to_string(), storage.clone());
                    None
                }
            }
        };
        if let Some(existing) = winner {
            storage.destroy().await;
            return Ok(existing);
        }

        info!(space = %id, "space storage connected");
        Ok(storage)
    }

    /// Non-creating lookup.
    pub fn get(&self, id: &SpaceId) -> Option<Arc<SpaceStorage>> {
        self.entries.lock().get(&id.to_string()).cloned()
    }

    /// Tear down and evict the cached entry. Safe to call for a space
    /// that was never connected.
    pub async fn disconnect(&self, id: &SpaceId) {
        let entry = self.entries.lock().remove(&id.to_string());
        if let Some(storage) = entry {
            storage.destroy().await;
            debug!(space = %id, "space storage disconnected");
        }
    }

    /// Disconnect a space and remove its entire on-disk file tree.
    pub async fn delete(&self, id: &SpaceId) -> Result<()> {
        self.disconnect(id).await;
        let dir = id.storage_dir(&self.config.root);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(space = %id, dir = %dir.display(), "space storage deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::StorageUnavailable(format!(
                "failed to delete {}: {e}",
                dir.display()
            ))),
        }
    }

    /// Tear down every cached instance. Best-effort: errors are logged
    /// and never propagate, so process exit is never blocked. Call this
    /// from the embedder's exit path.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Arc<SpaceStorage>)> =
            self.entries.lock().drain().collect();
        for (key, storage) in drained {
            debug!(space = %key, "shutting down space storage");
            storage.destroy().await;
        }
        info!("storage pool shut down");
    }

    /// Forward one space's connection events onto the pool stream. The
    /// task ends when the space's connection is dropped.
    fn spawn_forwarder(&self, space: SpaceId, storage: &SpaceStorage) {
        let mut rx = storage.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        let _ = events.send(PoolEvent {
                            space: space.clone(),
                            status: ev.status,
                            error: ev.error,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(space = %space, skipped, "pool event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::{DocUpdate, SpaceType};

    fn space_id(id: &str) -> SpaceId {
        SpaceId::new("device-a", SpaceType::Workspace, id).unwrap()
    }

    fn test_pool(dir: &tempfile::TempDir) -> StoragePool {
        StoragePool::new(PoolConfig {
            root: dir.path().to_path_buf(),
        })
    }

    #[tokio::test]
    async fn test_ensure_caches_one_instance() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir);
        let id = space_id("ws-1");

        let a = pool.ensure(&id).await.unwrap();
        let b = pool.ensure(&id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_get_is_non_creating() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir);
        let id = space_id("ws-1");

        assert!(pool.get(&id).is_none());
        pool.ensure(&id).await.unwrap();
        assert!(pool.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_disconnect_evicts_and_is_recreatable() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir);
        let id = space_id("ws-1");

        let first = pool.ensure(&id).await.unwrap();
        pool.disconnect(&id).await;
        assert!(pool.get(&id).is_none());

        let second = pool.ensure(&id).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir);
        pool.disconnect(&space_id("never-seen")).await;
    }

    #[tokio::test]
    async fn test_delete_removes_file_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir);
        let id = space_id("ws-1");

        let storage = pool.ensure(&id).await.unwrap();
        storage
            .docs()
            .push_update(DocUpdate::new("doc1", Bytes::from_static(&[0u8])))
            .await
            .unwrap();
        let space_dir = id.storage_dir(dir.path());
        assert!(space_dir.exists());

        pool.delete(&id).await.unwrap();
        assert!(!space_dir.exists());

        // Deleting an absent space is fine.
        pool.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir);
        let id = space_id("ws-1");

        let mut rx = pool.subscribe();
        pool.ensure(&id).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(ev) =
            tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await
        {
            let ev = ev.unwrap();
            assert_eq!(ev.space, id);
            seen.push(ev.status);
            if ev.status == ConnectionStatus::Connected {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[tokio::test]
    async fn test_dropping_subscribers_leaves_stores_alive() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir);
        let id = space_id("ws-1");

        let rx = pool.subscribe();
        let storage = pool.ensure(&id).await.unwrap();
        drop(rx);

        storage
            .docs()
            .push_update(DocUpdate::new("doc1", Bytes::from_static(&[0u8])))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir);
        pool.ensure(&space_id("ws-1")).await.unwrap();
        pool.ensure(&space_id("ws-2")).await.unwrap();

        pool.shutdown().await;
        assert!(pool.get(&space_id("ws-1")).is_none());
        assert!(pool.get(&space_id("ws-2")).is_none());
    }
}
