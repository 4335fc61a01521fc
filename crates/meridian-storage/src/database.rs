//! Storage facade
//!
//! Composes the connection pool, migrator, observer registry and
//! cross-process notifier behind one entry point. Owns the database file
//! for the process lifetime; the pool is replaced wholesale after a
//! migration or a device-transfer file swap, never mutated in place.

use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use meridian_ipc::CrossProcessNotifier;

use crate::error::StorageError;
use crate::migrations::Migrator;
use crate::observation::{ObserverRegistry, Touch};
use crate::pool::{ConnectionPool, WriteTransaction};
use crate::Result;

const COMPLETION_THREAD: &str = "meridian-storage-completion";

/// Capability interface the facade uses to ask its owner whether process
/// bootstrap has finished. Before that point, touches recorded without an
/// observer registry are dropped with a diagnostic; afterwards a missing
/// registry is a programming error.
pub trait StorageDelegate: Send + Sync {
    fn is_storage_ready(&self) -> bool;
}

/// Outcome of [`Storage::reload_transferred_database`].
///
/// One failure mode has a known-safe remedy distinct from corruption: a
/// benign key-cache mismatch after a file swap, where the fix is a full
/// process relaunch rather than a crash or a data wipe.
#[derive(Debug)]
pub enum ReloadOutcome {
    Success,
    RelaunchRequired,
    FailedMigration(StorageError),
    Unknown(StorageError),
}

pub struct Storage {
    database_path: PathBuf,
    legacy_dir: Option<PathBuf>,
    delegate: Arc<dyn StorageDelegate>,
    migrator: Migrator,
    pool: RwLock<Option<Arc<ConnectionPool>>>,
    observation: Arc<RwLock<Option<Arc<ObserverRegistry>>>>,
    notifier: Arc<CrossProcessNotifier>,
    reload_observers: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
    rewarm_hooks: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
    completion: CompletionQueue,
    corruption_detected: AtomicBool,
}

impl Storage {
    pub fn new(
        database_path: impl Into<PathBuf>,
        legacy_dir: Option<PathBuf>,
        delegate: Arc<dyn StorageDelegate>,
    ) -> Result<Self> {
        Self::with_migrator(database_path.into(), legacy_dir, delegate, Migrator::baseline())
    }

    fn with_migrator(
        database_path: PathBuf,
        legacy_dir: Option<PathBuf>,
        delegate: Arc<dyn StorageDelegate>,
        migrator: Migrator,
    ) -> Result<Self> {
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let notifier = Arc::new(CrossProcessNotifier::new(&database_path)?);
        let observation: Arc<RwLock<Option<Arc<ObserverRegistry>>>> =
            Arc::new(RwLock::new(None));

        // A sibling-process write invalidates everything since the last
        // known state: replay it through the registry as an external
        // change, gated on process activation.
        {
            let observation = Arc::clone(&observation);
            notifier.on_change_when_active(move || {
                let registry = observation.read().clone();
                if let Some(registry) = registry {
                    registry.notify_external();
                }
            });
        }

        Ok(Self {
            database_path,
            legacy_dir,
            delegate,
            migrator,
            pool: RwLock::new(None),
            observation,
            notifier,
            reload_observers: Mutex::new(Vec::new()),
            rewarm_hooks: Mutex::new(Vec::new()),
            completion: CompletionQueue::new()?,
            corruption_detected: AtomicBool::new(false),
        })
    }

    /// Opens the connection pool if it is not already open. Idempotent.
    pub fn open(&self) -> Result<()> {
        self.ensure_pool().map(|_| ())
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Runs `body` on a pooled reader inside one WAL snapshot.
    pub fn read<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T>,
    {
        self.ensure_pool()?.read(body)
    }

    /// Runs `body` in the process-wide exclusive write transaction. After
    /// the commit is durable, the touch set is delivered to the observer
    /// registry and sibling processes are signaled asynchronously.
    ///
    /// Must not be called recursively from inside a write body, and long
    /// network-bound work must not run inside the body: it would hold the
    /// single writer connection for its whole duration.
    pub fn write<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        let pool = self.ensure_pool()?;
        let (value, touches) = pool.write(body)?;
        self.deliver_touches(touches);
        self.notifier.notify_changed_async();
        Ok(value)
    }

    /// Startup driver, invoked once. Applies pending migrations; when any
    /// ran, the pool is torn down and rebuilt against the migrated file
    /// before `completion` runs. Either way `completion` is delivered on
    /// the facade's single completion thread, so callers never race the
    /// reopen.
    pub fn run_migrations_on_main_database<F>(&self, completion: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = self.ensure_pool()?;
        let outcome = self.migrator.run(&pool);
        drop(pool);

        let did_run = match outcome {
            Ok(did_run) => did_run,
            Err(err) => {
                self.record_migration_failure(&err);
                return Err(err);
            }
        };
        if did_run {
            self.reopen_pool()?;
        }
        self.completion.run(Box::new(completion));
        Ok(())
    }

    /// Reloads after an external transfer replaced the database file at
    /// our path. Order is fixed: migrate the transferred file, reopen the
    /// pool, fire "storage did reload", then rewarm caches. Caches must
    /// never warm against a pool that is about to be discarded.
    pub fn reload_transferred_database(&self) -> ReloadOutcome {
        tracing::info!(path = %self.database_path.display(), "Reloading transferred database");

        // Connections in the old pool still reference the replaced inode;
        // they go first.
        self.drop_pool();

        let pool = match self.ensure_pool() {
            Ok(pool) => pool,
            Err(err) => return self.classify_reload_error(err),
        };
        let migration = self.migrator.run(&pool);
        drop(pool);
        if let Err(err) = migration {
            return match err {
                StorageError::Migration { .. } => {
                    self.record_migration_failure(&err);
                    ReloadOutcome::FailedMigration(err)
                }
                other => self.classify_reload_error(other),
            };
        }

        if let Err(err) = self.reopen_pool() {
            return self.classify_reload_error(err);
        }

        for observer in self.reload_observers.lock().iter() {
            observer();
        }
        for hook in self.rewarm_hooks.lock().iter() {
            hook();
        }

        ReloadOutcome::Success
    }

    /// Deletes the database with its WAL/SHM sidecars and the legacy
    /// storage directory. Irreversible; idempotent; safe when nothing
    /// exists. A subsequent `open` builds a fresh file from scratch.
    pub fn reset_all_storage(&self) -> Result<()> {
        self.drop_pool();

        remove_file_if_exists(&self.database_path)?;
        remove_file_if_exists(&sidecar(&self.database_path, "-wal"))?;
        remove_file_if_exists(&sidecar(&self.database_path, "-shm"))?;
        if let Some(legacy) = &self.legacy_dir {
            match std::fs::remove_dir_all(legacy) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        tracing::info!(path = %self.database_path.display(), "All storage deleted");
        Ok(())
    }

    /// Installs the observer registry. Touches committed before this are
    /// dropped (bootstrap window only).
    pub fn install_observation(&self, registry: Arc<ObserverRegistry>) {
        *self.observation.write() = Some(registry);
    }

    pub fn observation(&self) -> Option<Arc<ObserverRegistry>> {
        self.observation.read().clone()
    }

    /// Registers a "storage did reload" observer, fired after a transfer
    /// reload completes and before any rewarm hook.
    pub fn add_reload_observer(&self, observer: impl Fn() + Send + Sync + 'static) {
        self.reload_observers.lock().push(Arc::new(observer));
    }

    /// Registers a cache-rewarm hook, fired after the reload observers.
    pub fn add_rewarm_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.rewarm_hooks.lock().push(Arc::new(hook));
    }

    /// Raised when a migration batch failed; external corruption-recovery
    /// tooling polls this.
    pub fn corruption_detected(&self) -> bool {
        self.corruption_detected.load(Ordering::SeqCst)
    }

    pub fn notifier(&self) -> &CrossProcessNotifier {
        &self.notifier
    }

    /// Forwards the app lifecycle transition to the cross-process
    /// notifier, releasing at most one coalesced external-write delivery.
    pub fn set_process_active(&self, active: bool) {
        self.notifier.set_process_active(active);
    }

    fn ensure_pool(&self) -> Result<Arc<ConnectionPool>> {
        {
            let slot = self.pool.read();
            if let Some(pool) = slot.as_ref() {
                return Ok(Arc::clone(pool));
            }
        }
        let mut slot = self.pool.write();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(ConnectionPool::open(&self.database_path)?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn drop_pool(&self) {
        let stale = self.pool.write().take();
        if let Some(pool) = stale {
            let liveness = Arc::downgrade(&pool);
            match Arc::try_unwrap(pool) {
                Ok(pool) => pool.release_all(),
                Err(retained) => drop(retained),
            }
            // Ownership-transfer check: nothing may retain the old pool.
            // Degrades to a no-op in release builds.
            debug_assert!(
                liveness.upgrade().is_none(),
                "stale connection pool retained across reopen"
            );
        }
    }

    fn reopen_pool(&self) -> Result<()> {
        self.drop_pool();
        let mut slot = self.pool.write();
        *slot = Some(Arc::new(ConnectionPool::open(&self.database_path)?));
        tracing::info!(path = %self.database_path.display(), "Connection pool reopened");
        Ok(())
    }

    fn deliver_touches(&self, touches: Vec<Touch>) {
        if touches.is_empty() {
            return;
        }
        let registry = self.observation.read().clone();
        match registry {
            Some(registry) => registry.notify_committed(&touches),
            None => {
                debug_assert!(
                    !self.delegate.is_storage_ready(),
                    "touches dropped after startup completed"
                );
                tracing::warn!(
                    dropped = touches.len(),
                    "No observer registry installed; dropping touch notifications"
                );
            }
        }
    }

    fn record_migration_failure(&self, err: &StorageError) {
        if matches!(err, StorageError::Migration { .. }) {
            self.corruption_detected.store(true, Ordering::SeqCst);
            tracing::error!(error = %err, "Migration failed; flagging database for recovery tooling");
        }
    }

    fn classify_reload_error(&self, err: StorageError) -> ReloadOutcome {
        if is_benign_bootstrap_failure(&err) {
            tracing::warn!("Bootstrap probe failed benignly after transfer; relaunch required");
            ReloadOutcome::RelaunchRequired
        } else {
            tracing::error!(error = %err, "Reload failed");
            ReloadOutcome::Unknown(err)
        }
    }
}

/// Engine-specific classification: a key-cache mismatch after a file swap
/// surfaces as `SQLITE_NOTADB` from the bootstrap probe at pool open.
/// Anything else stays unclassified.
fn is_benign_bootstrap_failure(err: &StorageError) -> bool {
    match err {
        StorageError::Open {
            source: rusqlite::Error::SqliteFailure(ffi_err, _),
            ..
        } => ffi_err.code == rusqlite::ErrorCode::NotADatabase,
        _ => false,
    }
}

struct CompletionQueue {
    tx: mpsc::Sender<Box<dyn FnOnce() + Send>>,
}

impl CompletionQueue {
    fn new() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        thread::Builder::new()
            .name(COMPLETION_THREAD.into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })?;
        Ok(Self { tx })
    }

    fn run(&self, job: Box<dyn FnOnce() + Send>) {
        let _ = self.tx.send(job);
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
