//! Universal workspace identifiers.
//!
//! Every workspace ("space") is addressed by a single string of the form
//! `{peer}:{space_type}:{id}`. The peer component may itself contain `:`
//! (device URLs are common), so the two *rightmost* fields are taken as
//! the id and the space type and the remainder is the peer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which kind of space a storage instance backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    /// A shared workspace, synchronized between collaborators.
    Workspace,
    /// A per-device private space.
    Userspace,
}

impl SpaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::Workspace => "workspace",
            SpaceType::Userspace => "userspace",
        }
    }
}

impl FromStr for SpaceType {
    type Err = ParseSpaceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workspace" => Ok(SpaceType::Workspace),
            "userspace" => Ok(SpaceType::Userspace),
            other => Err(ParseSpaceIdError::UnknownSpaceType(other.to_string())),
        }
    }
}

impl fmt::Display for SpaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors produced when parsing or constructing a [`SpaceId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseSpaceIdError {
    #[error("malformed universal id: {0:?}")]
    Malformed(String),
    #[error("unknown space type: {0:?}")]
    UnknownSpaceType(String),
    #[error("universal id component may not be empty: {0:?}")]
    EmptyComponent(String),
    #[error("space id may not contain ':': {0:?}")]
    ReservedCharacter(String),
}

/// Uniquely addresses one storage engine instance.
///
/// Parsing and formatting are a bijection over valid `(peer, type, id)`
/// triples: `parse(format(t)) == t` and `format(parse(s)) == s`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpaceId {
    peer: String,
    space_type: SpaceType,
    id: String,
}

impl SpaceId {
    /// Build a `SpaceId` from its components, validating them.
    ///
    /// The id may not contain `:` (it would break the universal string
    /// encoding); the peer may, so device URLs remain usable.
    pub fn new(
        peer: impl Into<String>,
        space_type: SpaceType,
        id: impl Into<String>,
    ) -> Result<Self, ParseSpaceIdError> {
        let peer = peer.into();
        let id = id.into();
        if peer.is_empty() {
            return Err(ParseSpaceIdError::EmptyComponent("peer".to_string()));
        }
        if id.is_empty() {
            return Err(ParseSpaceIdError::EmptyComponent("id".to_string()));
        }
        if id.contains(':') {
            return Err(ParseSpaceIdError::ReservedCharacter(id));
        }
        Ok(Self {
            peer,
            space_type,
            id,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn space_type(&self) -> SpaceType {
        self.space_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// On-disk directory for this space under a storage root:
    /// `<root>/<peer>/<id>`.
    pub fn storage_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.peer).join(&self.id)
    }
}

impl FromStr for SpaceId {
    type Err = ParseSpaceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // rsplitn yields the fields right-to-left: id, space type, peer.
        let mut parts = s.rsplitn(3, ':');
        let id = parts
            .next()
            .ok_or_else(|| ParseSpaceIdError::Malformed(s.to_string()))?;
        let space_type = parts
            .next()
            .ok_or_else(|| ParseSpaceIdError::Malformed(s.to_string()))?;
        let peer = parts
            .next()
            .ok_or_else(|| ParseSpaceIdError::Malformed(s.to_string()))?;
        if peer.is_empty() || space_type.is_empty() || id.is_empty() {
            return Err(ParseSpaceIdError::Malformed(s.to_string()));
        }
        Self::new(peer, space_type.parse()?, id)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.peer, self.space_type, self.id)
    }
}
