//! Content hashing and the delta-sync codec.
//!
//! A snapshot travels with a metadata sidecar describing the whole-file
//! hash and per-block signatures.  The metadata either arrives from the
//! sync endpoint (incremental update) or is captured while a full database
//! streams to disk.  [`delta::sync`] rebuilds a new snapshot from an
//! existing local file, the new metadata and ranged fetches of whatever
//! blocks could not be found locally.

use std::io;

use thiserror::Error;

pub mod delta;
pub mod hash;
pub mod metadata;

pub use delta::{sync, RangeRequestFactory};
pub use hash::{hash_file, HashAlgorithm, RollingChecksum};
pub use metadata::{Metadata, MetadataCapture};

/// Media type of the metadata sidecar.
pub const METADATA_MEDIATYPE: &str = "application/vnd.jrsync+jrsmd";

/// File extension of the metadata sidecar.
pub const METADATA_EXT: &str = "jrsmd";

/// Media type of a raw campaign database.
pub const DB_MEDIATYPE: &str = "application/x-sqlite3";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("malformed metadata: {0}")]
    Malformed(String),
    #[error("range {start}-{end} returned {actual} bytes")]
    RangeLength { start: u64, end: u64, actual: u64 },
    #[error("range request failed")]
    Range(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Io(#[from] io::Error),
}
