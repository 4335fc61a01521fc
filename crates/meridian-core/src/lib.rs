//! Meridian Core
//!
//! Composition layer for the Meridian storage stack: configuration,
//! unified errors, logging init, and the startup gate consulted by the
//! storage facade. External collaborators (registration workflow, search
//! indexer, UI) depend on this crate rather than the members directly.

mod config;
mod error;
mod startup;

pub use config::Config;
pub use error::CoreError;
pub use startup::StartupGate;

// Re-export the storage surface
pub use meridian_ipc::{CrossProcessNotifier, IpcError, ProcessActivation};
pub use meridian_storage::{
    ChangeObserver, ConnectionPool, Migration, Migrator, ObserverRegistry, ReindexSink,
    ReloadOutcome, Storage, StorageDelegate, StorageError, Subscription, Touch, WriteTransaction,
};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
