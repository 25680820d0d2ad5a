#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Tracestore - an embedded storage layer for trace data
//!
//! Tracestore serializes many independent producer and consumer components
//! (trace writers, aggregators, UI queries) through a single physical SQLite
//! connection, without corrupting state or leaking resources. There is
//! exactly one connection by design; all access goes through one exclusive
//! lock.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - **[`datasource`]**: The access gateway and everything behind it
//!   - `DataStore`: execute/query/update/batch operations, all serialized
//!   - `schema`: declarative table/column/index synchronization
//!   - `error`: the `DbError` taxonomy
//!   - connection holder, statement cache, and process-exit shutdown hook
//!
//! - **[`config`]**: Store tuning (cache sizes, read timeout) from TOML
//!   files and `TRACESTORE_*` environment variables
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tracestore::{Column, ColumnType, DataStore, StoreConfig};
//!
//! let config = StoreConfig::new(&None)?;
//! let store = DataStore::open(config.sqlite_path(), &config)?;
//!
//! // reconcile the schema at startup
//! store.sync_table(
//!     "trace",
//!     &[
//!         Column::primary_key("id", ColumnType::Integer),
//!         Column::new("capture_time", ColumnType::Integer),
//!         Column::new("payload", ColumnType::Text),
//!     ],
//! )?;
//!
//! // concurrent writers and readers share the store freely
//! store.update(
//!     "INSERT INTO trace (capture_time, payload) VALUES (?1, ?2)",
//!     rusqlite::params![1_700_000_000_i64, "span"],
//! )?;
//! let total = store.query_for_long("SELECT COUNT(*) FROM trace", [])?;
//!
//! // periodic maintenance
//! store.delete_before("trace", 1_690_000_000)?;
//! store.defrag()?;
//! ```
//!
//! # Shutdown behavior
//!
//! Once a store is closing (explicit [`DataStore::close`], drop, or the
//! process-exit hook), operations degrade to no-ops returning zero-valued
//! results instead of erroring, so components still writing during teardown
//! do not turn the shutdown log into noise.

pub mod config;
pub mod datasource;

pub use config::StoreConfig;
pub use datasource::{Column, ColumnType, DataStore, DbError, Index, Result, SchemaSync};
