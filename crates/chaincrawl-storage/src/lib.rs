//! chaincrawl-storage — pluggable storage backends for ChainCrawl.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - `sqlite` — SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres` — PostgreSQL via `sqlx` (production)
//!
//! [`open_storage`] picks a backend from a database URL.

use std::sync::Arc;

use chaincrawl_core::error::CrawlerError;
use chaincrawl_core::storage::Storage;

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{FailPoint, MemoryStorage};

/// Open the backend named by `url`'s scheme: `memory:`, `sqlite:<path>`, or
/// `postgres://` / `postgresql://`. The schema is created if missing.
pub async fn open_storage(url: &str) -> Result<Arc<dyn Storage>, CrawlerError> {
    if url == "memory:" || url == "memory" {
        return Ok(Arc::new(MemoryStorage::new()));
    }
    if url.starts_with("sqlite:") {
        return open_sqlite(url).await;
    }
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return open_postgres(url).await;
    }
    Err(CrawlerError::Config(format!("unsupported database url '{url}'")))
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(url: &str) -> Result<Arc<dyn Storage>, CrawlerError> {
    Ok(Arc::new(sqlite::SqliteStorage::open(url).await?))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_url: &str) -> Result<Arc<dyn Storage>, CrawlerError> {
    Err(CrawlerError::Config("built without the `sqlite` feature".into()))
}

#[cfg(feature = "postgres")]
async fn open_postgres(url: &str) -> Result<Arc<dyn Storage>, CrawlerError> {
    Ok(Arc::new(postgres::PostgresStorage::connect(url).await?))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_url: &str) -> Result<Arc<dyn Storage>, CrawlerError> {
    Err(CrawlerError::Config("built without the `postgres` feature".into()))
}
