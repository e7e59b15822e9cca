//! Error taxonomy for the storage layer.
//!
//! Absence of a doc, blob, or clock is a normal outcome and is modeled
//! as `None`/empty, never as an error.

use common::ParseSpaceIdError;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid workspace identifier: {0}")]
    InvalidIdentifier(#[from] ParseSpaceIdError),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("failed to save document updates: {0}")]
    FailedToSaveUpdates(#[source] sqlx::Error),

    #[error("failed to upsert blob {key:?}: {source}")]
    FailedToUpsertBlob {
        key: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("store file failed validation: {0}")]
    CorruptStore(String),

    #[error("storage engine error: {0}")]
    Unknown(#[from] sqlx::Error),
}

impl StorageError {
    /// Reclassify a generic engine error as a doc-write failure.
    ///
    /// Connection-level errors (`StorageUnavailable`, ...) pass through
    /// untouched so callers still see why the engine was unreachable.
    pub(crate) fn into_doc_write(self) -> Self {
        match self {
            StorageError::Unknown(e) => StorageError::FailedToSaveUpdates(e),
            other => other,
        }
    }

    /// Reclassify a generic engine error as a blob-upsert failure.
    pub(crate) fn into_blob_write(self, key: &str) -> Self {
        match self {
            StorageError::Unknown(e) => StorageError::FailedToUpsertBlob {
                key: key.to_string(),
                source: e,
            },
            other => other,
        }
    }
}
