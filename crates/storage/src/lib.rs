//! Drift storage engine.
//!
//! Local-first persistence for collaborative workspaces: each space
//! owns one SQLite database holding CRDT document updates, binary
//! blobs, and cross-peer sync clocks. The doc, blob, and sync stores
//! share a single reference-counted connection that checkpoints,
//! survives drops via transparent reconnect, and is cached process-wide
//! by [`StoragePool`].

pub mod blob;
pub mod connection;
pub mod db;
pub mod doc;
pub mod error;
pub mod meta;
pub mod pool;
pub mod space;
pub mod sync;

pub use blob::BlobStore;
pub use connection::{Connection, ConnectionShare, ConnectionStatus, StatusEvent};
pub use db::SpaceDb;
pub use doc::DocStore;
pub use error::{Result, StorageError};
pub use meta::SpaceMeta;
pub use pool::{PoolConfig, PoolEvent, StoragePool};
pub use space::{SpaceStorage, Store, STORE_NAMES};
pub use sync::SyncStore;

// Re-export the domain types so consumers only need one crate.
pub use common::{
    BlobEntry, BlobRecord, BlobState, DocClock, DocUpdate, ParseSpaceIdError, SetBlob, SpaceId,
    SpaceType,
};
