//! Schema migrations
//!
//! Ordered, idempotent steps identified by string ids. Applied ids are
//! recorded in a reserved `schema_migrations` table inside the database
//! file; one run applies every pending step in a single write transaction,
//! so either the whole batch lands or none of it does.

use chrono::Utc;
use rusqlite::Connection;
use std::collections::HashSet;

use crate::error::StorageError;
use crate::pool::ConnectionPool;
use crate::Result;

const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        id TEXT PRIMARY KEY,
        applied_at TEXT NOT NULL
    );
"#;

/// One schema change. Ids establish the fixed total order and must never
/// be reused or renamed once shipped.
pub struct Migration {
    pub id: &'static str,
    pub apply: fn(&Connection) -> rusqlite::Result<()>,
}

pub struct Migrator {
    steps: Vec<Migration>,
}

impl Migrator {
    /// The shipping step list: the messenger schema.
    pub fn baseline() -> Self {
        Self::with_steps(vec![
            Migration {
                id: "0001_initial_schema",
                apply: migrate_initial_schema,
            },
            Migration {
                id: "0002_attachments",
                apply: migrate_attachments,
            },
            Migration {
                id: "0003_message_indexes",
                apply: migrate_message_indexes,
            },
        ])
    }

    pub fn with_steps(steps: Vec<Migration>) -> Self {
        Self { steps }
    }

    /// Applies every not-yet-applied step in order.
    ///
    /// Returns whether anything ran. An up-to-date file returns `false`
    /// without opening a write transaction. A failing step rolls the
    /// whole batch back and surfaces as [`StorageError::Migration`]; a
    /// partially applied batch is never observable.
    pub fn run(&self, pool: &ConnectionPool) -> Result<bool> {
        let applied = self.applied_ids(pool)?;
        let pending: Vec<&Migration> = self
            .steps
            .iter()
            .filter(|step| !applied.contains(step.id))
            .collect();
        if pending.is_empty() {
            tracing::debug!("Schema is current; no migrations to run");
            return Ok(false);
        }

        pool.write(|tx| {
            tx.execute_batch(CREATE_MIGRATIONS_TABLE)?;
            for step in &pending {
                tracing::info!(id = step.id, "Applying migration");
                (step.apply)(tx).map_err(|source| StorageError::Migration {
                    id: step.id,
                    source,
                })?;
                tx.execute(
                    "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
                    rusqlite::params![step.id, Utc::now().to_rfc3339()],
                )?;
            }
            Ok(())
        })?;

        tracing::info!(count = pending.len(), "Migration batch committed");
        Ok(true)
    }

    fn applied_ids(&self, pool: &ConnectionPool) -> Result<HashSet<&'static str>> {
        let ids = pool.read(|conn| {
            let table_count: i64 = conn.query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
                [],
                |row| row.get(0),
            )?;
            if table_count == 0 {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare("SELECT id FROM schema_migrations")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })?;

        // Resolve persisted ids against the registered step list; ids from
        // the future (newer build wrote them) simply stay applied.
        Ok(self
            .steps
            .iter()
            .map(|step| step.id)
            .filter(|id| ids.iter().any(|applied| applied.as_str() == *id))
            .collect())
    }
}

fn migrate_initial_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS threads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            title TEXT,
            archived INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id INTEGER NOT NULL,
            sender TEXT NOT NULL,
            body TEXT,
            received_at TEXT NOT NULL,
            FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
        );
    "#,
    )
}

fn migrate_attachments(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS attachments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL,
            file_path TEXT NOT NULL,
            mime_type TEXT,
            byte_count INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);
    "#,
    )
}

fn migrate_message_indexes(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
        CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at);
    "#,
    )
}
