//! Error taxonomy: small `thiserror` enums per concern rather than one
//! catch-all, distinguishing error kinds by variant instead of exception
//! class hierarchies.

use crate::digest::Digest;
use thiserror::Error;

/// Errors from the write path.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Declared digest != hash of written bytes.
    #[error("digest mismatch: expected {expected}, got hash {actual_hash} over {actual_size} bytes")]
    DigestMismatch {
        expected: Digest,
        actual_hash: String,
        actual_size: u64,
    },
    /// Bytes committed != declared size.
    #[error("incomplete blob: expected {expected} bytes, got {actual}")]
    IncompleteBlob { expected: u64, actual: u64 },
    /// Blob exceeds `max_entry_size`.
    #[error("entry of size {size} exceeds max_entry_size {max}")]
    EntryLimit { size: u64, max: u64 },
    #[error("write was cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from directory materialization.
#[derive(Error, Debug)]
pub enum MaterializeError {
    /// One or more file-node put operations failed; carries every cause.
    #[error("failed to materialize directory {digest}: {} underlying error(s)", .causes.len())]
    PutDirectory {
        digest: Digest,
        causes: Vec<MaterializeError>,
    },
    #[error("directory {0} not found in directory tree source")]
    NotFound(Digest),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    DirectoriesIndex(#[from] DirectoriesIndexError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("materialization was interrupted")]
    Interrupted,
}

/// Errors from the [crate::directories_index::DirectoriesIndex] collaborator.
#[derive(Error, Debug)]
pub enum DirectoriesIndexError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Top-level error surfaced by the [crate::cache::Cache] facade.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error(transparent)]
    DirectoriesIndex(#[from] DirectoriesIndexError),
    #[error("digest {0} not found")]
    NotFound(Digest),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("operation was interrupted")]
    Interrupted,
}
