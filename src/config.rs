use anyhow::{anyhow, Result};
use config::Config;
use std::collections::HashMap;
use std::path::Path;

/// Tunables for a [`DataStore`](crate::DataStore).
///
/// Loaded from an optional TOML file plus `TRACESTORE_*` environment
/// overrides, e.g. `TRACESTORE_CACHE_SIZE_KB=16384`.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the directory holding the store's data files
    pub data_dir: String,

    /// SQLite page-cache budget in KiB (default: 8192)
    pub cache_size_kb: u32,

    /// Capacity of the per-connection prepared-statement cache (default: 64)
    pub statement_cache_capacity: usize,

    /// Timeout applied to read statements, in seconds; 0 disables it
    /// (default: 0). Writes always bypass the timeout.
    pub query_timeout_secs: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        Self {
            data_dir: format!("{}/.tracestore", home_dir),
            cache_size_kb: 8192,
            statement_cache_capacity: 64,
            query_timeout_secs: 0,
        }
    }
}

impl StoreConfig {
    /// Create a configuration from an optional TOML file and the
    /// environment.
    ///
    /// Settings from the environment (prefix `TRACESTORE`) override the
    /// file; anything unset falls back to the defaults.
    pub fn new(path: &Option<String>) -> Result<StoreConfig> {
        let mut builder = Config::builder();

        if let Some(p) = path {
            if Path::new(p.as_str()).exists() {
                builder = builder.add_source(config::File::with_name(p.as_str()));
            }
        }

        // E.g., `TRACESTORE_DATA_DIR=/var/lib/app ./app` sets the data directory
        builder = builder.add_source(config::Environment::with_prefix("TRACESTORE"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let values = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        let defaults = StoreConfig::default();

        let data_dir = values
            .get("data_dir")
            .cloned()
            .unwrap_or(defaults.data_dir);

        let cache_size_kb = values
            .get("cache_size_kb")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cache_size_kb);

        let statement_cache_capacity = values
            .get("statement_cache_capacity")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.statement_cache_capacity);

        let query_timeout_secs = values
            .get("query_timeout_secs")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.query_timeout_secs);

        Ok(StoreConfig {
            data_dir,
            cache_size_kb,
            statement_cache_capacity,
            query_timeout_secs,
        })
    }

    /// Get the path to the SQLite database file
    pub fn sqlite_path(&self) -> String {
        let data_dir = self.data_dir.trim_end_matches('/');
        format!("{}/tracestore.sqlite3", data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.cache_size_kb, 8192);
        assert_eq!(config.statement_cache_capacity, 64);
        assert_eq!(config.query_timeout_secs, 0);
    }

    #[test]
    fn test_sqlite_path() {
        let config = StoreConfig {
            data_dir: "/test/dir/".to_string(),
            ..StoreConfig::default()
        };
        assert_eq!(config.sqlite_path(), "/test/dir/tracestore.sqlite3");
    }

    #[test]
    fn test_new_without_file_uses_defaults() {
        let config = StoreConfig::new(&None).unwrap();
        assert_eq!(config.statement_cache_capacity, 64);
    }
}
