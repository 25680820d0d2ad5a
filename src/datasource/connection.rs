//! Database connection management
//!
//! `DatabaseConn` owns the single live SQLite connection backing a
//! [`DataStore`](super::DataStore). It is created either file-backed or
//! in-memory, carries the per-connection prepared-statement cache, and is
//! closed exactly once. Replacing the connection (during defragmentation)
//! discards the whole statement cache with it, so no cached statement can
//! outlive the connection it was prepared against.

use std::os::raw::c_int;
use std::path::Path;
use std::time::{Duration, Instant};

use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

use crate::config::StoreConfig;
use crate::datasource::error::{self, DbError, Result};

/// How many SQLite VM instructions run between read-timeout deadline checks.
const TIMEOUT_CHECK_OPS: c_int = 4096;

/// Wrapper around the one live SQLite connection.
pub(crate) struct DatabaseConn {
    pub(crate) conn: Connection,
}

impl DatabaseConn {
    /// Open a file-backed connection at the specified path.
    pub(crate) fn open_file(path: &Path, config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, config)
    }

    /// Open an ephemeral in-memory connection.
    pub(crate) fn open_memory(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, config)
    }

    fn from_connection(mut conn: Connection, config: &StoreConfig) -> Result<Self> {
        // Engine-side statement tracing at debug level on the
        // `tracestore::sql` target; this is where bound arguments appear,
        // expanded into the SQL text.
        conn.trace(Some(trace_sql));
        conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);
        let db = DatabaseConn { conn };
        db.configure(config)?;
        Ok(db)
    }

    /// Configure the connection with the store's pragma settings.
    fn configure(&self, config: &StoreConfig) -> Result<()> {
        // WAL keeps readers cheap; in-memory databases report "memory" here
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        self.conn.execute("PRAGMA synchronous=NORMAL", [])?;

        // Negative cache_size is a KiB budget rather than a page count
        self.conn
            .execute(&format!("PRAGMA cache_size=-{}", config.cache_size_kb), [])?;

        self.conn.execute("PRAGMA temp_store=MEMORY", [])?;
        self.conn.execute("PRAGMA foreign_keys=ON", [])?;

        Ok(())
    }

    /// Run `f` against the connection with the read timeout armed.
    ///
    /// A timeout of zero seconds means no timeout. The deadline is enforced
    /// through SQLite's progress handler, so it bounds statement execution
    /// only, never lock acquisition; an expired deadline surfaces as an
    /// interrupt error from the engine. The handler is disarmed before
    /// returning regardless of the outcome, so write statements issued later
    /// on this connection are never subject to a stale read deadline.
    pub(crate) fn run_with_read_timeout<T>(
        &self,
        timeout_secs: u32,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        if timeout_secs == 0 {
            return f(&self.conn);
        }
        let deadline = Instant::now() + Duration::from_secs(u64::from(timeout_secs));
        self.conn
            .progress_handler(TIMEOUT_CHECK_OPS, Some(move || Instant::now() >= deadline));
        let result = f(&self.conn);
        self.conn.progress_handler(0, None::<fn() -> bool>);
        result
    }

    /// Close the connection, flushing pending WAL frames first.
    ///
    /// The handle is released even if the checkpoint fails, and per the
    /// layer's error contract the checkpoint failure takes precedence over
    /// any failure from the release itself.
    pub(crate) fn close(self) -> Result<()> {
        let DatabaseConn { conn } = self;
        let checkpoint = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .optional()
            .map(|_| ())
            .map_err(DbError::from);
        let release = conn.close().map_err(|(_conn, e)| DbError::from(e));
        error::with_close(checkpoint, release)
    }

    /// Close the connection, logging any failure instead of returning it.
    ///
    /// Used where another failure already takes precedence or where errors
    /// must not propagate (process-exit hook, connection replacement).
    pub(crate) fn close_quietly(self) {
        if let Err(e) = self.close() {
            warn!("error closing database connection: {e}");
        }
    }
}

fn trace_sql(sql: &str) {
    tracing::debug!(target: "tracestore::sql", "{sql}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let db = DatabaseConn::open_memory(&StoreConfig::default());
        assert!(db.is_ok());
    }

    #[test]
    fn test_prepared_statement_cache_roundtrip() {
        let db = DatabaseConn::open_memory(&StoreConfig::default()).unwrap();
        db.conn
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", [])
            .unwrap();

        // Same SQL text twice; the second prepare hits the cache.
        for _ in 0..2 {
            let mut stmt = db.conn.prepare_cached("SELECT COUNT(*) FROM t").unwrap();
            let count: i64 = stmt.query_row([], |row| row.get(0)).unwrap();
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_read_timeout_passthrough() {
        let db = DatabaseConn::open_memory(&StoreConfig::default()).unwrap();

        let one: i64 = db
            .run_with_read_timeout(0, |conn| Ok(conn.query_row("SELECT 1", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(one, 1);

        // A generous deadline must not interfere with a fast query.
        let two: i64 = db
            .run_with_read_timeout(30, |conn| Ok(conn.query_row("SELECT 2", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(two, 2);
    }

    #[test]
    fn test_close_ok() {
        let db = DatabaseConn::open_memory(&StoreConfig::default()).unwrap();
        assert!(db.close().is_ok());
    }

    #[test]
    fn test_file_backed_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conn-test.sqlite3");
        let config = StoreConfig::default();

        {
            let db = DatabaseConn::open_file(&path, &config).unwrap();
            db.conn
                .execute("CREATE TABLE t (v INTEGER)", [])
                .unwrap();
            db.conn.execute("INSERT INTO t (v) VALUES (42)", []).unwrap();
            db.close().unwrap();
        }

        let db = DatabaseConn::open_file(&path, &config).unwrap();
        let v: i64 = db
            .conn
            .query_row("SELECT v FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, 42);
    }
}
