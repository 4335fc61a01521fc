//! Meridian Storage Layer
//!
//! Transactional SQLite persistence shared between the app process and
//! the notification-service extension. All writes are serialized through
//! a single writer connection; readers run concurrently against WAL
//! snapshots. Cross-process invalidation is advisory, via `meridian-ipc`.

mod database;
mod error;
mod migrations;
mod observation;
mod pool;

pub use database::{ReloadOutcome, Storage, StorageDelegate};
pub use error::StorageError;
pub use migrations::{Migration, Migrator};
pub use observation::{ChangeObserver, ObserverRegistry, ReindexSink, Subscription, Touch};
pub use pool::{ConnectionPool, WriteTransaction};

pub type Result<T> = std::result::Result<T, StorageError>;
