//! Connection pool adapter
//!
//! Owns pooled reader connections and one writer connection against a
//! single database file. Readers run concurrently, each inside a deferred
//! transaction so a body observes one WAL snapshot; the writer is
//! exclusive, so write-write conflicts cannot occur. Pools are replaced
//! on reopen, never mutated: dropping a pool closes every connection.

use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StorageError;
use crate::observation::Touch;
use crate::Result;

const READER_POOL_SIZE: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// The known bootstrap query, run against a fresh connection at open.
/// Failing it with `SQLITE_NOTADB` is the signature of a benign key-cache
/// mismatch after a file transfer; reload classification depends on it.
const BOOTSTRAP_PROBE: &str = "SELECT count(*) FROM sqlite_master";

pub struct ConnectionPool {
    path: PathBuf,
    readers: Pool<SqliteConnectionManager>,
    writer: Mutex<Connection>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Opens the pool against the database file at `path`, creating the
    /// file when missing. Fails on corrupt, foreign-format or unreadable
    /// files: the writer connection runs the bootstrap probe before any
    /// reader is built.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let writer = Connection::open(&path)
            .and_then(|conn| {
                configure(&conn)?;
                bootstrap_probe(&conn)?;
                Ok(conn)
            })
            .map_err(|source| StorageError::Open {
                path: path.clone(),
                source,
            })?;

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| configure(conn));
        let readers = Pool::builder()
            .max_size(READER_POOL_SIZE)
            .connection_timeout(BUSY_TIMEOUT)
            .build(manager)?;

        tracing::debug!(path = %path.display(), readers = READER_POOL_SIZE, "Connection pool opened");

        Ok(Self {
            path,
            readers,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `body` on a reader connection, blocking while the reader
    /// slots are exhausted. The body executes inside a deferred
    /// transaction: its first read pins a WAL snapshot, so a concurrent
    /// commit never appears mid-body.
    pub fn read<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.readers.get()?;
        let tx = conn.unchecked_transaction()?;
        let value = body(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs `body` on the single writer connection inside an IMMEDIATE
    /// transaction, blocking until the writer is free. Commits on `Ok`
    /// and returns the resolved touch set; rolls back and propagates on
    /// `Err`. At most one write transaction is active process-wide.
    ///
    /// Must not be called recursively from inside a write body: the
    /// writer lock is not reentrant and the nested call would deadlock.
    pub fn write<T, F>(&self, body: F) -> Result<(T, Vec<Touch>)>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        let mut writer = self.writer.lock();
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut write_tx = WriteTransaction {
            tx,
            touches: Vec::new(),
            remaps: Vec::new(),
        };
        match body(&mut write_tx) {
            Ok(value) => {
                let touches = write_tx.commit()?;
                Ok((value, touches))
            }
            Err(err) => {
                // Dropping the transaction rolls back; the writer slot is
                // freed when the guard unwinds.
                drop(write_tx);
                Err(err)
            }
        }
    }

    /// Drains every connection by consuming the pool. Used before a
    /// reopen so no stale connection survives a migration or file swap;
    /// a drained pool cannot be reused.
    pub fn release_all(self) {
        drop(self);
    }
}

/// Scoped handle for one write transaction. Dereferences to the
/// underlying connection for SQL; additionally accumulates the ordered
/// touch set and identifier remappings delivered to observers after
/// commit.
pub struct WriteTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
    touches: Vec<Touch>,
    remaps: Vec<IdRemap>,
}

struct IdRemap {
    kind: String,
    provisional_id: i64,
    final_id: i64,
}

impl<'conn> WriteTransaction<'conn> {
    /// Marks an entity as changed. No side effect until commit; on
    /// rollback the touch set is discarded with the transaction.
    pub fn touch(&mut self, kind: impl Into<String>, id: i64, should_reindex: bool) {
        self.touches.push(Touch {
            kind: kind.into(),
            id,
            should_reindex,
        });
    }

    /// Records an identifier remapping, applied to already-enqueued
    /// touches at commit. Used when a provisional identifier is replaced
    /// by the final row id mid-transaction.
    pub fn update_id_mapping(
        &mut self,
        kind: impl Into<String>,
        provisional_id: i64,
        final_id: i64,
    ) {
        self.remaps.push(IdRemap {
            kind: kind.into(),
            provisional_id,
            final_id,
        });
    }

    fn commit(self) -> Result<Vec<Touch>> {
        let WriteTransaction {
            tx,
            mut touches,
            remaps,
        } = self;
        tx.commit()?;
        for remap in &remaps {
            for touch in touches.iter_mut() {
                if touch.kind == remap.kind && touch.id == remap.provisional_id {
                    touch.id = remap.final_id;
                }
            }
        }
        Ok(touches)
    }
}

impl std::ops::Deref for WriteTransaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // WAL mode for concurrent readers against a stable snapshot
    let _: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

fn bootstrap_probe(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row(BOOTSTRAP_PROBE, [], |row| row.get::<_, i64>(0))
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn open_pool(dir: &tempfile::TempDir) -> ConnectionPool {
        ConnectionPool::open(dir.path().join("store.db")).unwrap()
    }

    fn create_kv(pool: &ConnectionPool) {
        pool.write(|tx| {
            tx.execute_batch(
                "CREATE TABLE kv (k INTEGER PRIMARY KEY, v INTEGER NOT NULL);
                 INSERT INTO kv (k, v) VALUES (1, 1);",
            )?;
            Ok(())
        })
        .unwrap();
    }

    fn read_v(conn: &Connection) -> crate::Result<i64> {
        Ok(conn.query_row("SELECT v FROM kv WHERE k = 1", [], |row| row.get(0))?)
    }

    #[test]
    fn open_fails_on_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        std::fs::write(&path, b"definitely not a database").unwrap();

        match ConnectionPool::open(&path) {
            Err(StorageError::Open { .. }) => {}
            other => panic!("expected open error, got {other:?}"),
        }
    }

    #[test]
    fn write_commits_on_ok() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir);
        create_kv(&pool);

        pool.write(|tx| {
            tx.execute("UPDATE kv SET v = 2 WHERE k = 1", [])?;
            Ok(())
        })
        .unwrap();

        let v = pool.read(read_v).unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn write_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir);
        create_kv(&pool);

        let result: crate::Result<((), Vec<Touch>)> = pool.write(|tx| {
            tx.execute("UPDATE kv SET v = 99 WHERE k = 1", [])?;
            Err(StorageError::Io(std::io::Error::other("caller failure")))
        });
        assert!(result.is_err());

        let v = pool.read(read_v).unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn writes_are_exclusive_and_commit_in_grant_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(open_pool(&dir));
        pool.write(|tx| {
            tx.execute_batch("CREATE TABLE log (seq INTEGER NOT NULL)")?;
            Ok(())
        })
        .unwrap();

        let in_body = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let grants = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let in_body = Arc::clone(&in_body);
                let peak = Arc::clone(&peak);
                let grants = Arc::clone(&grants);
                thread::spawn(move || {
                    pool.write(|tx| {
                        let now = in_body.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        let seq = grants.fetch_add(1, Ordering::SeqCst) as i64;
                        tx.execute("INSERT INTO log (seq) VALUES (?1)", [seq])?;
                        thread::sleep(std::time::Duration::from_millis(2));
                        in_body.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Exactly one body at a time, committed in grant order.
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let seqs: Vec<i64> = pool
            .read(|conn| {
                let mut stmt = conn.prepare("SELECT seq FROM log ORDER BY rowid")?;
                let seqs = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(seqs)
            })
            .unwrap();
        assert_eq!(seqs, (0..8).collect::<Vec<i64>>());
    }

    #[test]
    fn read_snapshot_ignores_concurrent_commit() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(open_pool(&dir));
        create_kv(&pool);

        let (started_tx, started_rx) = mpsc::channel();
        let (committed_tx, committed_rx) = mpsc::channel::<()>();

        let reader = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.read(|conn| {
                    let before = read_v(conn)?;
                    started_tx.send(()).unwrap();
                    committed_rx.recv().unwrap();
                    let after = read_v(conn)?;
                    Ok((before, after))
                })
                .unwrap()
            })
        };

        started_rx.recv().unwrap();
        pool.write(|tx| {
            tx.execute("UPDATE kv SET v = 2 WHERE k = 1", [])?;
            Ok(())
        })
        .unwrap();
        committed_tx.send(()).unwrap();

        let (before, after) = reader.join().unwrap();
        assert_eq!(before, 1);
        assert_eq!(after, 1);

        // A fresh read sees the committed value.
        assert_eq!(pool.read(read_v).unwrap(), 2);
    }

    #[test]
    fn touch_set_survives_commit_with_remapped_ids() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir);
        create_kv(&pool);

        let ((), touches) = pool
            .write(|tx| {
                tx.touch("message", -1, true);
                tx.touch("thread", 7, false);
                tx.update_id_mapping("message", -1, 42);
                Ok(())
            })
            .unwrap();

        assert_eq!(
            touches,
            vec![
                Touch {
                    kind: "message".into(),
                    id: 42,
                    should_reindex: true,
                },
                Touch {
                    kind: "thread".into(),
                    id: 7,
                    should_reindex: false,
                },
            ]
        );
    }

    #[test]
    fn released_pool_allows_a_fresh_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let pool = ConnectionPool::open(&path).unwrap();
        create_kv(&pool);
        pool.release_all();

        let pool = ConnectionPool::open(&path).unwrap();
        assert_eq!(pool.read(read_v).unwrap(), 1);
    }

    #[test]
    fn touch_set_is_discarded_on_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir);
        create_kv(&pool);

        let result: crate::Result<((), Vec<Touch>)> = pool.write(|tx| {
            tx.touch("message", 1, false);
            Err(StorageError::Io(std::io::Error::other("caller failure")))
        });
        assert!(result.is_err());
    }
}
