//! Core data structures for the Drift storage layer.
//!
//! This crate holds the domain types shared by every consumer of the
//! storage engine: the universal workspace identifier and the record
//! types the stores read and write. It carries no I/O of its own.

pub mod record;
pub mod space;

pub use record::{BlobEntry, BlobRecord, BlobState, DocClock, DocUpdate, SetBlob};
pub use space::{ParseSpaceIdError, SpaceId, SpaceType};
