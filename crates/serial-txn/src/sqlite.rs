use super::Store;
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::ops::Deref;
use std::path::Path;

/// SqliteStore is a Store over a single SQLite connection.
/// Its one transaction is committed in place by operations,
/// with a following transaction begun immediately after each commit.
pub struct SqliteStore {
    conn: Option<Connection>,
}

/// SqliteTxn is the connection of a SqliteStore while its transaction is open.
pub struct SqliteTxn {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(BOOTSTRAP)
            .context("failed to bootstrap the database")?;

        Ok(Self { conn: Some(conn) })
    }
}

impl Store for SqliteStore {
    type Txn = SqliteTxn;

    fn begin(&mut self) -> anyhow::Result<SqliteTxn> {
        let conn = self
            .conn
            .take()
            .context("SQLite connection already has an open transaction")?;

        if let Err(err) = conn.execute_batch("BEGIN IMMEDIATE;") {
            self.conn = Some(conn);
            return Err(err).context("failed to begin transaction");
        }
        tracing::debug!("began SQLite transaction");

        Ok(SqliteTxn { conn })
    }

    fn release(&mut self, txn: SqliteTxn) -> anyhow::Result<()> {
        let SqliteTxn { conn } = txn;

        // Anything which wasn't committed is discarded.
        let result = conn
            .execute_batch("ROLLBACK;")
            .context("failed to roll back transaction");
        self.conn = Some(conn);

        result
    }
}

impl SqliteTxn {
    /// Commit the current transaction and begin the next one.
    pub fn commit(&mut self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                r#"
                COMMIT;
                BEGIN IMMEDIATE;
                "#,
            )
            .context("failed to commit transaction")?;

        Ok(())
    }

    /// Roll back the current transaction and begin the next one.
    pub fn rollback(&mut self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                r#"
                ROLLBACK;
                BEGIN IMMEDIATE;
                "#,
            )
            .context("failed to roll back transaction")?;

        Ok(())
    }

    pub fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO kv (key, value) VALUES (?, ?)
                    ON CONFLICT (key) DO UPDATE SET value = excluded.value;",
                rusqlite::params![key, value],
            )
            .with_context(|| format!("failed to put key {key}"))?;

        Ok(())
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?;", [key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("failed to get key {key}"))
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?;", [key])
            .with_context(|| format!("failed to delete key {key}"))?;

        Ok(deleted != 0)
    }

    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM kv ORDER BY key;")
            .context("failed to prepare list query")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to list keys")?;

        Ok(rows)
    }
}

impl Deref for SqliteTxn {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

const BOOTSTRAP: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;
