//! Persistence for meter readings
//!
//! Two horizons are kept:
//!
//! - **Short horizon**: [`csv_log::ShortHorizonWriter`] appends every reading
//!   to the current day's CSV file, files older than a few days are removed.
//! - **Long horizon**: a [`StorageBackend`] (SQLite, or in-memory when none is
//!   configured) receives buffered readings on a slower cadence together with
//!   the daily aggregates from [`aggregate::AggregateBook`].
//!
//! ## Usage
//!
//! ```no_run
//! use substation_monitor::config::StorageConfig;
//! use substation_monitor::storage::open_backend;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = open_backend(&StorageConfig::default()).await?;
//!     println!("{}", backend.get_stats().await?);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod backend;
pub mod csv_log;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

pub use aggregate::{AggregateBook, AggregateRecord, AggregateSnapshot, ParameterStats};
pub use backend::{HealthStatus, QueryRange, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use schema::ReadingRow;

use crate::config::StorageConfig;

/// Open the configured long-horizon backend
pub async fn open_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::None => {
            info!("no long-horizon storage configured, keeping readings in memory");
            Ok(Arc::new(memory::MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, .. } => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(sqlite::SqliteBackend::new(path).await?))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::InvalidConfig(
            "SQLite storage requested but the storage-sqlite feature is disabled".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_none_opens_memory_backend() {
        let backend = open_backend(&StorageConfig::None).await.unwrap();
        let health = backend.health_check().await.unwrap();
        assert_eq!(health.metadata["backend"], "memory");
    }

    #[cfg(feature = "storage-sqlite")]
    #[tokio::test]
    async fn test_sqlite_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::Sqlite {
            path: dir.path().join("nested").join("readings.db"),
            retention_days: 30,
        };
        let backend = open_backend(&config).await.unwrap();
        assert!(backend.health_check().await.unwrap().healthy);
    }
}
