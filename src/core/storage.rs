use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::core::models::{Manifest, StorageLocation};
use crate::error::ArchiveError;

pub type ArchiveBody = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, Serialize)]
pub struct StoredArchive {
    pub name: String,
    pub location: StorageLocation,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

/// Write-once destination for finished archives.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Store a new archive. Writing a name that already exists is an error.
    async fn write(
        &self,
        target_id: &str,
        name: &str,
        manifest: &Manifest,
        body: ArchiveBody,
    ) -> Result<StorageLocation, ArchiveError>;

    /// Archives stored for a target, in no particular order.
    async fn list(&self, target_id: &str) -> Result<Vec<StoredArchive>, ArchiveError>;

    async fn delete(&self, location: &StorageLocation) -> Result<(), ArchiveError>;
}
