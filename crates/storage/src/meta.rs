//! Non-authoritative `meta.json` sidecar.
//!
//! Lives next to `storage.db` and carries display metadata for UI
//! convenience only. The database never depends on it; load and store
//! are both best-effort.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

const META_FILE: &str = "meta.json";

/// Display metadata for one space directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMeta {
    pub name: Option<String>,
    pub path: PathBuf,
}

impl SpaceMeta {
    /// Read the sidecar from a space directory. Any failure (missing
    /// file, bad JSON) is simply `None`.
    pub fn load(dir: &Path) -> Option<Self> {
        let raw = std::fs::read(dir.join(META_FILE)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Write the sidecar. Failures are logged and swallowed; display
    /// metadata is never worth failing an operation over.
    pub fn store(&self, dir: &Path) {
        let path = dir.join(META_FILE);
        let bytes = match serde_json::to_vec_pretty(self) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to encode space meta");
                return;
            }
        };
        if let Err(e) = std::fs::write(&path, bytes) {
            warn!(path = %path.display(), error = %e, "failed to write space meta");
        }
    }
}
