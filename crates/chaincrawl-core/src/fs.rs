//! The filesystem collaborator used by the raw-dump path.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CrawlerError;

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Write `bytes` to `path`, replacing any existing file.
    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), CrawlerError>;
}

/// Writes to the local disk, creating parent directories as needed.
#[derive(Debug, Default, Clone)]
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), CrawlerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        debug!(path = %path.display(), len = bytes.len(), "file written");
        Ok(())
    }
}
