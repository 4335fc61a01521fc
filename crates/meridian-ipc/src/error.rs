//! IPC error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid signal path: {0}")]
    InvalidPath(String),
}
