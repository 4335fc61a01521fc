//! Storage error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// The database file could not be opened or failed the bootstrap
    /// probe. There is no degraded mode for a storage layer that cannot
    /// open its file; callers treat this as fatal.
    #[error("Failed to open database at {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A migration step failed; the whole batch was rolled back.
    #[error("Migration {id} failed: {source}")]
    Migration {
        id: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Cross-process signaling error: {0}")]
    Ipc(#[from] meridian_ipc::IpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
