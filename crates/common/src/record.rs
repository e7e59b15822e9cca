//! Record types moved between callers and the per-space stores.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One CRDT update to append to a document's history.
///
/// The payload is an opaque binary update in the CRDT library's wire
/// format; this layer never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate {
    pub doc_id: String,
    pub bin: Bytes,
}

impl DocUpdate {
    pub fn new(doc_id: impl Into<String>, bin: impl Into<Bytes>) -> Self {
        Self {
            doc_id: doc_id.into(),
            bin: bin.into(),
        }
    }
}

/// A document's sync progress marker: "this doc changed at t".
///
/// Not a wall-clock guarantee, only a monotonic progress marker used by
/// the sync protocol to diff local and remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocClock {
    pub doc_id: String,
    pub timestamp: DateTime<Utc>,
}

impl DocClock {
    pub fn new(doc_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            doc_id: doc_id.into(),
            timestamp,
        }
    }
}

/// Input to a blob upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetBlob {
    /// Content-derived key, unique within a workspace.
    pub key: String,
    pub data: Bytes,
    pub mime: String,
}

/// Lifecycle state of a stored blob row.
///
/// Purged blobs have no row at all, so a purged-but-listed blob is
/// unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    Active,
    SoftDeleted { deleted_at: DateTime<Utc> },
}

impl BlobState {
    pub fn is_deleted(&self) -> bool {
        matches!(self, BlobState::SoftDeleted { .. })
    }
}

/// A stored blob with its content, as returned by `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub key: String,
    pub data: Bytes,
    pub mime: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

/// A blob listing entry: metadata only, no content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub key: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub state: BlobState,
}
