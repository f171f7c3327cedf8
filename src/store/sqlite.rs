//! SQLite-backed ordered store
//!
//! A single `kv` table keyed by BLOB. SQLite compares BLOBs with
//! `memcmp`, which gives the lexicographic key order the key-space
//! layout relies on.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{BatchOp, KvPair, KvStore};
use crate::error::{Error, Result};

/// Persistent store backed by SQLite
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    /// Open a throwaway in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                k BLOB PRIMARY KEY NOT NULL,
                v BLOB NOT NULL
            ) WITHOUT ROWID;
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("SQLite connection lock poisoned".into()))
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT v FROM kv WHERE k = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (k, v) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE k = ?1", params![key])?;
        Ok(())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut put = tx.prepare_cached("INSERT OR REPLACE INTO kv (k, v) VALUES (?1, ?2)")?;
            let mut del = tx.prepare_cached("DELETE FROM kv WHERE k = ?1")?;
            for op in &ops {
                match op {
                    BatchOp::Put { key, value } => {
                        put.execute(params![key, value])?;
                    }
                    BatchOp::Delete { key } => {
                        del.execute(params![key])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn seek_prev(&self, key: &[u8]) -> Result<Option<KvPair>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT k, v FROM kv WHERE k < ?1 ORDER BY k DESC LIMIT 1",
                params![key],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    fn scan_from(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT k, v FROM kv WHERE k >= ?1 AND k < ?2 ORDER BY k LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![start, end, limit as i64], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
