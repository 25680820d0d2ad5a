//! Schema synchronization
//!
//! Callers describe tables and indexes declaratively ([`Column`], [`Index`])
//! and [`SchemaSync`] reconciles the descriptions against the live database:
//! missing tables and columns are created, missing indexes are created, and
//! surplus or drifted indexes are dropped or rebuilt. Surplus table columns
//! are left in place (schema sync must never destroy data).
//!
//! The gateway invokes all of these under its global lock, so schema changes
//! cannot interleave with concurrent reads or writes.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::datasource::error::Result;

/// Storage type of a column, in SQLite affinity terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
}

impl ColumnType {
    fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }

    /// Map a declared column type back to a [`ColumnType`], following
    /// SQLite's affinity rules.
    fn from_declared(declared: &str) -> ColumnType {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") {
            ColumnType::Text
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnType::Real
        } else if upper.contains("BLOB") || upper.is_empty() {
            ColumnType::Blob
        } else {
            ColumnType::Text
        }
    }
}

/// Declarative description of a single table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Column {
            name: name.into(),
            column_type,
            primary_key: false,
        }
    }

    pub fn primary_key(name: impl Into<String>, column_type: ColumnType) -> Self {
        Column {
            name: name.into(),
            column_type,
            primary_key: true,
        }
    }

    fn definition(&self) -> String {
        let mut def = format!("{} {}", self.name, self.column_type.as_sql());
        if self.primary_key {
            def.push_str(" PRIMARY KEY");
        }
        def
    }
}

/// Declarative description of an index on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl Index {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Index {
            name: name.into(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(name: impl Into<String>, columns: &[&str]) -> Self {
        Index {
            unique: true,
            ..Index::new(name, columns)
        }
    }

    fn create_sql(&self, table: &str) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            table,
            self.columns.join(", ")
        )
    }
}

/// Schema synchronizer for a live connection
///
/// Borrows the connection for the duration of the reconciliation; the
/// gateway holds its lock across that borrow.
pub struct SchemaSync<'a> {
    conn: &'a Connection,
}

impl<'a> SchemaSync<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Reconcile a table against its declarative description.
    ///
    /// Creates the table if it does not exist; otherwise adds any missing
    /// columns. Surplus columns are logged and left untouched. Idempotent
    /// across repeated calls.
    pub fn sync_table(&self, table: &str, columns: &[Column]) -> Result<()> {
        if !self.table_exists(table)? {
            let defs: Vec<String> = columns.iter().map(Column::definition).collect();
            debug!("creating table {table}");
            self.conn
                .execute_batch(&format!("CREATE TABLE {} ({})", table, defs.join(", ")))?;
            return Ok(());
        }

        let existing = self.get_columns(table)?;
        for column in columns {
            if !existing
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name))
            {
                debug!("adding column {} to table {table}", column.name);
                self.conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    table,
                    column.definition()
                ))?;
            }
        }
        for column in &existing {
            if !columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name))
            {
                warn!(
                    "table {table} has surplus column {}, leaving it in place",
                    column.name
                );
            }
        }
        Ok(())
    }

    /// Reconcile the indexes of a table against their declarative
    /// description: create missing ones, drop surplus ones, and rebuild any
    /// whose column set drifted. Only indexes created through this layer are
    /// considered (auto-indexes from UNIQUE or PRIMARY KEY constraints are
    /// ignored).
    pub fn sync_indexes(&self, table: &str, indexes: &[Index]) -> Result<()> {
        let existing = self.created_index_names(table)?;

        for name in &existing {
            if !indexes.iter().any(|ix| &ix.name == name) {
                debug!("dropping surplus index {name}");
                self.conn.execute_batch(&format!("DROP INDEX {name}"))?;
            }
        }

        for index in indexes {
            if existing.contains(&index.name) {
                if self.index_columns(&index.name)? == index.columns {
                    continue;
                }
                debug!("rebuilding index {} with new column set", index.name);
                self.conn
                    .execute_batch(&format!("DROP INDEX {}", index.name))?;
            }
            self.conn.execute_batch(&index.create_sql(table))?;
        }
        Ok(())
    }

    /// The columns of a table as declarative descriptions. Empty if the
    /// table does not exist.
    pub fn get_columns(&self, table: &str) -> Result<Vec<Column>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({table})"))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(Column {
                    name: row.get(1)?,
                    column_type: ColumnType::from_declared(&row.get::<_, String>(2)?),
                    primary_key: row.get::<_, i64>(5)? > 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self
            .get_columns(table)?
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(column)))
    }

    /// Names of explicitly created indexes on a table (origin "c" in
    /// `PRAGMA index_list`).
    fn created_index_names(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA index_list({table})"))?;
        let entries = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(1)?, row.get::<_, String>(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries
            .into_iter()
            .filter(|(_, origin)| origin == "c")
            .map(|(name, _)| name)
            .collect())
    }

    /// Column names of an index, in index order. Expression parts have no
    /// column name and are skipped.
    fn index_columns(&self, index: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA index_info({index})"))?;
        let mut parts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        parts.sort_by_key(|(seq, _)| *seq);
        Ok(parts.into_iter().filter_map(|(_, name)| name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn trace_columns() -> Vec<Column> {
        vec![
            Column::primary_key("id", ColumnType::Integer),
            Column::new("capture_time", ColumnType::Integer),
            Column::new("payload", ColumnType::Text),
        ]
    }

    #[test]
    fn test_sync_table_creates() {
        let conn = test_conn();
        let sync = SchemaSync::new(&conn);

        sync.sync_table("trace", &trace_columns()).unwrap();

        assert!(sync.table_exists("trace").unwrap());
        assert!(!sync.table_exists("missing").unwrap());
    }

    #[test]
    fn test_sync_table_adds_missing_columns() {
        let conn = test_conn();
        let sync = SchemaSync::new(&conn);

        sync.sync_table("trace", &trace_columns()).unwrap();

        let mut columns = trace_columns();
        columns.push(Column::new("duration_nanos", ColumnType::Integer));
        sync.sync_table("trace", &columns).unwrap();

        assert!(sync.column_exists("trace", "duration_nanos").unwrap());
        // re-sync with the same description is a no-op
        sync.sync_table("trace", &columns).unwrap();
    }

    #[test]
    fn test_sync_table_keeps_surplus_columns() {
        let conn = test_conn();
        let sync = SchemaSync::new(&conn);

        sync.sync_table("trace", &trace_columns()).unwrap();
        // shrink the description; the existing column must survive
        sync.sync_table("trace", &trace_columns()[..2]).unwrap();

        assert!(sync.column_exists("trace", "payload").unwrap());
    }

    #[test]
    fn test_get_columns_reports_types_and_pk() {
        let conn = test_conn();
        let sync = SchemaSync::new(&conn);

        sync.sync_table("trace", &trace_columns()).unwrap();
        let columns = sync.get_columns("trace").unwrap();

        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary_key);
        assert_eq!(columns[0].column_type, ColumnType::Integer);
        assert_eq!(columns[2].name, "payload");
        assert_eq!(columns[2].column_type, ColumnType::Text);

        assert!(sync.get_columns("missing").unwrap().is_empty());
    }

    #[test]
    fn test_sync_indexes_create_and_drop() {
        let conn = test_conn();
        let sync = SchemaSync::new(&conn);
        sync.sync_table("trace", &trace_columns()).unwrap();

        let by_time = Index::new("trace_idx", &["capture_time"]);
        sync.sync_indexes("trace", std::slice::from_ref(&by_time))
            .unwrap();
        assert_eq!(sync.created_index_names("trace").unwrap(), vec!["trace_idx"]);

        // replaced by a differently named index; the old one is dropped
        let by_payload = Index::new("trace_payload_idx", &["payload"]);
        sync.sync_indexes("trace", std::slice::from_ref(&by_payload))
            .unwrap();
        assert_eq!(
            sync.created_index_names("trace").unwrap(),
            vec!["trace_payload_idx"]
        );
    }

    #[test]
    fn test_sync_indexes_rebuilds_on_column_drift() {
        let conn = test_conn();
        let sync = SchemaSync::new(&conn);
        sync.sync_table("trace", &trace_columns()).unwrap();

        sync.sync_indexes("trace", &[Index::new("trace_idx", &["capture_time"])])
            .unwrap();
        sync.sync_indexes(
            "trace",
            &[Index::new("trace_idx", &["capture_time", "payload"])],
        )
        .unwrap();

        assert_eq!(
            sync.index_columns("trace_idx").unwrap(),
            vec!["capture_time", "payload"]
        );
    }

    #[test]
    fn test_column_type_from_declared() {
        assert_eq!(ColumnType::from_declared("BIGINT"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("VARCHAR(32)"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared("DOUBLE"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Blob);
    }
}
