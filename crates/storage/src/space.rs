//! Per-space storage composition.
//!
//! A [`SpaceStorage`] wires the doc, blob, and sync stores over one
//! shared connection and aggregates their lifecycle: connect once,
//! checkpoint, destroy. Stores are reachable both through typed
//! accessors and through the name registry used by dynamic callers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;
use yrs::updates::decoder::Decode;
use yrs::{Any, Doc, Map, Out, Transact, Update};

use common::SpaceId;

use crate::blob::BlobStore;
use crate::connection::{Connection, ConnectionShare, StatusEvent};
use crate::doc::DocStore;
use crate::error::Result;
use crate::meta::SpaceMeta;
use crate::sync::SyncStore;

/// The fixed set of store names in the registry.
pub const STORE_NAMES: [&str; 3] = ["docs", "blobs", "sync"];

/// A store looked up by name.
pub enum Store<'a> {
    Docs(&'a DocStore),
    Blobs(&'a BlobStore),
    Sync(&'a SyncStore),
}

/// All storage for one space, behind one shared connection.
pub struct SpaceStorage {
    id: SpaceId,
    dir: PathBuf,
    conn: Arc<Connection>,
    shares: Arc<ConnectionShare>,
    docs: DocStore,
    blobs: BlobStore,
    sync: SyncStore,
}

impl SpaceStorage {
    /// Wire up the stores for `id` under `root`, sharing (or creating)
    /// the space's connection through `shares`. Nothing touches disk
    /// until [`connect`](Self::connect).
    pub fn open(id: SpaceId, root: &Path, shares: Arc<ConnectionShare>) -> Self {
        let dir = id.storage_dir(root);
        let conn = shares.share(&id, dir.join("storage.db"));
        let docs = DocStore::new(conn.clone());
        let blobs = BlobStore::new(conn.clone());
        let sync = SyncStore::new(conn.clone());
        Self {
            id,
            dir,
            conn,
            shares,
            docs,
            blobs,
            sync,
        }
    }

    pub fn id(&self) -> &SpaceId {
        &self.id
    }

    /// The on-disk directory holding `storage.db` and its side files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn docs(&self) -> &DocStore {
        &self.docs
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn sync(&self) -> &SyncStore {
        &self.sync
    }

    /// Look up a store by registry name.
    pub fn try_get(&self, name: &str) -> Option<Store<'_>> {
        match name {
            "docs" => Some(Store::Docs(&self.docs)),
            "blobs" => Some(Store::Blobs(&self.blobs)),
            "sync" => Some(Store::Sync(&self.sync)),
            _ => None,
        }
    }

    /// Like [`try_get`](Self::try_get), but panics on an unknown name.
    /// The registry names are the fixed set in [`STORE_NAMES`], so an
    /// unknown name is a programmer error.
    pub fn get(&self, name: &str) -> Store<'_> {
        match self.try_get(name) {
            Some(store) => store,
            None => panic!("unknown store {name:?}"),
        }
    }

    /// Connect the shared connection once, no matter how many stores
    /// reference it, and refresh the display sidecar.
    pub async fn connect(&self) -> Result<()> {
        self.conn.connect().await?;
        let meta = SpaceMeta {
            name: self.space_name().await,
            path: self.dir.clone(),
        };
        meta.store(&self.dir);
        Ok(())
    }

    /// Flush the WAL so the database file can be copied externally.
    pub async fn checkpoint(&self) -> Result<()> {
        self.conn.checkpoint().await
    }

    /// Subscribe to this space's connection status events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.conn.subscribe()
    }

    /// Release this storage's reference to the shared connection. The
    /// connection closes once unreferenced; on-disk data is untouched
    /// (workspace deletion is a separate pool-level operation).
    pub async fn destroy(&self) {
        debug!(space = %self.id, "destroying space storage");
        self.shares.release(&self.id).await;
    }

    /// Best-effort display name, read from the root document's `meta`
    /// map. Purely a convenience for UI surfaces; returns `None` on any
    /// failure rather than erroring.
    pub async fn space_name(&self) -> Option<String> {
        let bin = match self.docs.get_doc(self.id.id()).await {
            Ok(Some(bin)) => bin,
            _ => return None,
        };
        let update = Update::decode_v1(&bin).ok()?;
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(update).ok()?;
        }
        let meta = doc.get_or_insert_map("meta");
        let txn = doc.transact();
        match meta.get(&txn, "name") {
            Some(Out::Any(Any::String(name))) => Some(name.to_string()),
            _ => None,
        }
    }
}
