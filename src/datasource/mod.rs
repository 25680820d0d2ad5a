//! Serialized single-connection data store
//!
//! This module provides the access gateway through which every database
//! operation passes:
//!
//! ```text
//! datasource/
//! ├── connection  # DatabaseConn: the one live SQLite connection
//! ├── schema      # declarative table/column/index synchronization
//! ├── error       # DbError taxonomy and close-error composition
//! └── shutdown    # process-exit hook registry
//! ```
//!
//! # Concurrency model
//!
//! Many threads share one [`DataStore`], which owns exactly one physical
//! connection guarded by one exclusive lock. Every operation holds the lock
//! for its full duration; SQLite is not assumed safe for concurrent
//! statement execution on a single connection, so there is no lock-free fast
//! path. The read timeout bounds statement execution only, never lock
//! acquisition.
//!
//! # Lifecycle
//!
//! The store is open from construction until [`DataStore::close`] or the
//! process-exit hook flips it to closing. While closing, operations degrade
//! to no-ops returning zero-valued results instead of erroring, so that
//! components still writing during teardown do not flood the log with
//! failures. Closed means the connection is released and the exit hook is
//! deregistered.

mod connection;
pub mod error;
pub mod schema;
mod shutdown;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Params, Row, Rows, Statement};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use connection::DatabaseConn;

pub use error::{DbError, Result};
pub use schema::{Column, ColumnType, Index, SchemaSync};

/// Rows deleted per iteration of [`DataStore::delete_before`]. Chunking
/// bounds how long one delete holds the lock, so sustained cleanup does not
/// starve other lock waiters.
const DELETE_CHUNK_SIZE: usize = 100;

/// The single synchronized entry point for all database access.
///
/// Cheap to share behind an [`Arc`]; all operations take `&self`.
pub struct DataStore {
    inner: Arc<StoreInner>,
    hook: shutdown::HookId,
}

pub(crate) struct StoreInner {
    /// `None` means in-memory.
    db_path: Option<PathBuf>,
    /// The connection holder. `None` only once the store is closed (or after
    /// a failed reconnect during defragmentation).
    state: Mutex<Option<DatabaseConn>>,
    /// Checked outside the lock by writers and re-checked under it.
    closing: AtomicBool,
    /// Read-statement timeout in seconds; 0 disables it.
    query_timeout_secs: AtomicU32,
    config: StoreConfig,
}

impl StoreInner {
    fn lock_state(&self) -> MutexGuard<'_, Option<DatabaseConn>> {
        // A poisoned lock must not brick teardown; recover the guard and
        // keep going.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Invoked by the process-exit hook. Flag first, outside the lock: any
    /// writers backlogged on the lock abort as soon as they acquire it,
    /// instead of piling failures into the shutdown log.
    pub(crate) fn close_from_exit_hook(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let mut guard = self.lock_state();
        if let Some(db) = guard.take() {
            db.close_quietly();
        }
    }
}

/// Borrow the connection out of the guarded state.
fn held<'a>(guard: &'a MutexGuard<'_, Option<DatabaseConn>>) -> Result<&'a DatabaseConn> {
    guard.as_ref().ok_or(DbError::ConnectionClosed)
}

impl DataStore {
    /// Open a file-backed store at the specified path.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let conn = DatabaseConn::open_file(path, config)?;
        info!("opened data store at {}", path.display());
        Ok(Self::from_conn(Some(path.to_path_buf()), conn, config))
    }

    /// Open an ephemeral in-memory store.
    pub fn open_in_memory(config: &StoreConfig) -> Result<Self> {
        let conn = DatabaseConn::open_memory(config)?;
        Ok(Self::from_conn(None, conn, config))
    }

    fn from_conn(db_path: Option<PathBuf>, conn: DatabaseConn, config: &StoreConfig) -> Self {
        let inner = Arc::new(StoreInner {
            db_path,
            state: Mutex::new(Some(conn)),
            closing: AtomicBool::new(false),
            query_timeout_secs: AtomicU32::new(config.query_timeout_secs),
            config: config.clone(),
        });
        let hook = shutdown::register(Arc::downgrade(&inner));
        DataStore { inner, hook }
    }

    /// Set the timeout applied to read statements. Zero disables it. Write
    /// statements deliberately bypass the timeout; bulk inserts must not be
    /// aborted by a read-oriented budget.
    pub fn set_query_timeout_secs(&self, secs: u32) {
        self.inner.query_timeout_secs.store(secs, Ordering::SeqCst);
    }

    /// Run one or more SQL statements with no result. No-op while closing.
    pub fn execute(&self, sql: &str) -> Result<()> {
        debug_sql(sql);
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(());
        }
        held(&guard)?.conn.execute_batch(sql)?;
        Ok(())
    }

    /// The first column of the first row, as an integer.
    ///
    /// An SQL NULL in that column (an aggregate like `MAX` over no rows)
    /// reads as 0. Returns 0 with a logged warning if the query produced no
    /// rows at all, and 0 while closing.
    pub fn query_for_long<P: Params>(&self, sql: &str, params: P) -> Result<i64> {
        use rusqlite::OptionalExtension;

        debug_sql(sql);
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(0);
        }
        let db = held(&guard)?;
        db.run_with_read_timeout(self.read_timeout(), |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let row = stmt
                .query_row(params, |row| row.get::<_, Option<i64>>(0))
                .optional()?;
            match row {
                Some(value) => Ok(value.unwrap_or(0)),
                None => {
                    warn!("query didn't return any results: {sql}");
                    Ok(0)
                }
            }
        })
    }

    /// True iff the query returns at least one row. False while closing.
    pub fn query_for_exists<P: Params>(&self, sql: &str, params: P) -> Result<bool> {
        debug_sql(sql);
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(false);
        }
        let db = held(&guard)?;
        db.run_with_read_timeout(self.read_timeout(), |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            Ok(stmt.exists(params)?)
        })
    }

    /// Run a parameterized read, applying `row_mapper` to every row in
    /// result order. Returns an empty vector while closing.
    pub fn query<T, P, F>(&self, sql: &str, params: P, row_mapper: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        debug_sql(sql);
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(Vec::new());
        }
        let db = held(&guard)?;
        db.run_with_read_timeout(self.read_timeout(), |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params, row_mapper)?;
            let mut mapped = Vec::new();
            for row in rows {
                mapped.push(row?);
            }
            Ok(mapped)
        })
    }

    /// Generalized extraction over the whole cursor, for single-scalar or
    /// custom aggregate reads. Returns `None` while closing.
    ///
    /// If the extractor fails, the cursor is still released and the
    /// extractor's error is the one surfaced to the caller.
    pub fn query_with<T, P, F>(&self, sql: &str, params: P, extractor: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&mut Rows<'_>) -> Result<T>,
    {
        debug_sql(sql);
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(None);
        }
        let db = held(&guard)?;
        db.run_with_read_timeout(self.read_timeout(), |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let mut rows = stmt.query(params)?;
            let value = extractor(&mut rows)?;
            Ok(Some(value))
        })
    }

    /// Run a mutating statement, returning the affected-row count.
    ///
    /// Returns 0 without touching the lock once the store is closing: trace
    /// writers can have a deep backlog during shutdown, and making each
    /// queued call wait for the lock only to no-op would stall teardown. The
    /// flag is re-checked under the lock to make the check race-free.
    pub fn update<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        if self.inner.is_closing() {
            return Ok(0);
        }
        debug_sql(sql);
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(0);
        }
        let db = held(&guard)?;
        let mut stmt = db.conn.prepare_cached(sql)?;
        Ok(stmt.execute(params)?)
    }

    /// Like [`update`](Self::update), but the caller binds parameters onto
    /// the prepared statement itself (positional, 1-indexed via
    /// [`Statement::raw_bind_parameter`]), for writes where a plain
    /// parameter list is insufficient.
    pub fn update_with<F>(&self, sql: &str, binder: F) -> Result<usize>
    where
        F: FnOnce(&mut Statement<'_>) -> Result<()>,
    {
        if self.inner.is_closing() {
            return Ok(0);
        }
        debug_sql(sql);
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(0);
        }
        let db = held(&guard)?;
        let mut stmt = db.conn.prepare_cached(sql)?;
        binder(&mut stmt)?;
        Ok(stmt.raw_execute()?)
    }

    /// Execute one statement against a batch of parameter sets inside a
    /// single transaction, returning per-set affected counts. Returns an
    /// empty vector while closing.
    pub fn batch_update<P, I>(&self, sql: &str, param_sets: I) -> Result<Vec<usize>>
    where
        P: Params,
        I: IntoIterator<Item = P>,
    {
        if self.inner.is_closing() {
            return Ok(Vec::new());
        }
        debug_sql(sql);
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(Vec::new());
        }
        let db = held(&guard)?;
        let tx = db.conn.unchecked_transaction()?;
        let mut counts = Vec::new();
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for params in param_sets {
                counts.push(stmt.execute(params)?);
            }
        }
        tx.commit()?;
        Ok(counts)
    }

    /// Delete all rows of `table` with `capture_time` before the cutoff,
    /// [`DELETE_CHUNK_SIZE`] rows at a time, looping until none remain. Each
    /// chunk is its own lock acquisition, so readers and other writers can
    /// interleave with a large cleanup.
    pub fn delete_before(&self, table: &str, capture_time: i64) -> Result<()> {
        let sql = format!(
            "DELETE FROM {table} WHERE rowid IN \
             (SELECT rowid FROM {table} WHERE capture_time < ?1 LIMIT {DELETE_CHUNK_SIZE})"
        );
        loop {
            let deleted = self.update(&sql, [capture_time])?;
            if deleted == 0 {
                return Ok(());
            }
        }
    }

    /// Compact the backing file and swap in a fresh connection.
    ///
    /// The prepared-statement cache dies with the old connection, so nothing
    /// can execute against the pre-compaction handle afterwards. No-op for
    /// in-memory stores (there is no file to compact) and while closing.
    pub fn defrag(&self) -> Result<()> {
        let Some(path) = self.inner.db_path.as_deref() else {
            return Ok(());
        };
        let mut guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(());
        }
        let Some(db) = guard.take() else {
            return Err(DbError::ConnectionClosed);
        };

        db.conn.flush_prepared_statement_cache();
        if let Err(e) = db.conn.execute_batch("VACUUM") {
            // compaction failed; keep the existing connection usable
            *guard = Some(db);
            return Err(e.into());
        }

        // The old handle is replaced either way; a failure closing it must
        // not mask the successful compaction.
        db.close_quietly();
        *guard = Some(DatabaseConn::open_file(path, &self.inner.config)?);
        info!("defragmented data store at {}", path.display());
        Ok(())
    }

    /// Reconcile a table against its declarative description, under the
    /// global lock. See [`SchemaSync::sync_table`].
    pub fn sync_table(&self, table: &str, columns: &[Column]) -> Result<()> {
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(());
        }
        SchemaSync::new(&held(&guard)?.conn).sync_table(table, columns)
    }

    /// Reconcile the indexes of a table, under the global lock. See
    /// [`SchemaSync::sync_indexes`].
    pub fn sync_indexes(&self, table: &str, indexes: &[Index]) -> Result<()> {
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(());
        }
        SchemaSync::new(&held(&guard)?.conn).sync_indexes(table, indexes)
    }

    pub fn get_columns(&self, table: &str) -> Result<Vec<Column>> {
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(Vec::new());
        }
        SchemaSync::new(&held(&guard)?.conn).get_columns(table)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(false);
        }
        SchemaSync::new(&held(&guard)?.conn).table_exists(table)
    }

    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(false);
        }
        SchemaSync::new(&held(&guard)?.conn).column_exists(table, column)
    }

    /// Rename a table if it exists. Idempotent across repeated upgrade
    /// attempts: once the old name is gone this is a no-op.
    pub fn rename_table(&self, old: &str, new: &str) -> Result<()> {
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(());
        }
        let db = held(&guard)?;
        if SchemaSync::new(&db.conn).table_exists(old)? {
            let sql = format!("ALTER TABLE {old} RENAME TO {new}");
            debug_sql(&sql);
            db.conn.execute_batch(&sql)?;
        }
        Ok(())
    }

    /// Rename a column if it exists. Idempotent, like
    /// [`rename_table`](Self::rename_table).
    pub fn rename_column(&self, table: &str, old: &str, new: &str) -> Result<()> {
        let guard = self.inner.lock_state();
        if self.inner.is_closing() {
            return Ok(());
        }
        let db = held(&guard)?;
        if SchemaSync::new(&db.conn).column_exists(table, old)? {
            let sql = format!("ALTER TABLE {table} RENAME COLUMN {old} TO {new}");
            debug_sql(&sql);
            db.conn.execute_batch(&sql)?;
        }
        Ok(())
    }

    /// Size of the backing database file in bytes; 0 for in-memory stores.
    pub fn db_file_size(&self) -> u64 {
        self.inner
            .db_path
            .as_ref()
            .and_then(|path| std::fs::metadata(path).ok())
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    /// Close the store: flip it to closing, release the connection exactly
    /// once, and deregister the process-exit hook. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut guard = self.inner.lock_state();
            if !self.inner.closing.swap(true, Ordering::SeqCst) {
                if let Some(db) = guard.take() {
                    db.close()?;
                }
            }
        }
        shutdown::deregister(self.hook);
        Ok(())
    }

    fn read_timeout(&self) -> u32 {
        self.inner.query_timeout_secs.load(Ordering::SeqCst)
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing data store: {e}");
        }
    }
}

fn debug_sql(sql: &str) {
    debug!(target: "tracestore::sql", "{sql}");
}
