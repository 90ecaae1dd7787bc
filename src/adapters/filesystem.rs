//! Local directory storage sink.
//!
//! Layout: `<root>/<target-id>/<name>.tar` with a `<name>.manifest.json`
//! sidecar. Both are written to a dot-prefixed `.partial` file first and
//! renamed into place, so a listed archive is always complete. Partial files
//! are removed even when the write future is dropped.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::core::models::{Manifest, StorageLocation};
use crate::core::storage::{ArchiveBody, StorageSink, StoredArchive};
use crate::error::ArchiveError;

const ARCHIVE_EXTENSION: &str = ".tar";
const MANIFEST_EXTENSION: &str = ".manifest.json";

pub struct FilesystemSink {
    root: PathBuf,
}

impl FilesystemSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the archive file behind a location handed out by this sink.
    pub fn archive_path(&self, location: &StorageLocation) -> Result<PathBuf, ArchiveError> {
        let path = PathBuf::from(&location.0);
        if !path.starts_with(&self.root) || !location.0.ends_with(ARCHIVE_EXTENSION) {
            return Err(ArchiveError::Sink(format!(
                "location '{}' does not belong to {}",
                location,
                self.root.display()
            )));
        }
        Ok(path)
    }

    fn target_dir(&self, target_id: &str) -> Result<PathBuf, ArchiveError> {
        check_component(target_id)?;
        Ok(self.root.join(target_id))
    }
}

fn check_component(value: &str) -> Result<(), ArchiveError> {
    if value.is_empty() || value.starts_with('.') || value.contains(['/', '\\']) {
        return Err(ArchiveError::Sink(format!(
            "'{}' is not a valid path component",
            value
        )));
    }
    Ok(())
}

fn sidecar_path(archive: &Path) -> PathBuf {
    let raw = archive.to_string_lossy();
    let stem = raw.strip_suffix(ARCHIVE_EXTENSION).unwrap_or(&raw);
    PathBuf::from(format!("{}{}", stem, MANIFEST_EXTENSION))
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Removes a `.partial` file on drop unless it was committed.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&mut self, to: &Path) -> std::io::Result<()> {
        std::fs::rename(&self.path, to)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial file");
            }
            _ => {}
        }
    }
}

async fn write_body(path: &Path, mut body: ArchiveBody) -> Result<u64, ArchiveError> {
    let mut file = tokio::fs::File::create(path).await?;
    let written = tokio::io::copy(&mut body, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[async_trait]
impl StorageSink for FilesystemSink {
    async fn write(
        &self,
        target_id: &str,
        name: &str,
        manifest: &Manifest,
        body: ArchiveBody,
    ) -> Result<StorageLocation, ArchiveError> {
        check_component(name)?;
        let dir = self.target_dir(target_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = dir.join(format!("{}{}", name, ARCHIVE_EXTENSION));
        if tokio::fs::try_exists(&final_path).await? {
            return Err(ArchiveError::AlreadyExists(name.to_string()));
        }

        let mut partial =
            PartialFile::new(dir.join(format!(".{}{}.partial", name, ARCHIVE_EXTENSION)));
        let written = write_body(partial.path(), body).await?;

        let manifest_json = serde_json::to_vec_pretty(manifest)?;
        let sidecar = sidecar_path(&final_path);
        let mut sidecar_partial =
            PartialFile::new(dir.join(format!(".{}{}.partial", name, MANIFEST_EXTENSION)));
        tokio::fs::write(sidecar_partial.path(), &manifest_json).await?;

        // no await between the renames, so a dropped write never splits them
        partial.commit(&final_path)?;
        if let Err(e) = sidecar_partial.commit(&sidecar) {
            if let Err(cleanup) = std::fs::remove_file(&final_path) {
                warn!(path = %final_path.display(), error = %cleanup, "Failed to roll back archive");
            }
            return Err(e.into());
        }

        debug!(
            target_id = %target_id,
            archive = %name,
            bytes = written,
            path = %final_path.display(),
            "Archive stored"
        );

        Ok(StorageLocation(final_path.to_string_lossy().into_owned()))
    }

    async fn list(&self, target_id: &str) -> Result<Vec<StoredArchive>, ArchiveError> {
        let dir = self.target_dir(target_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut archives = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }
            let Some(name) = file_name.strip_suffix(ARCHIVE_EXTENSION) else {
                continue;
            };

            let path = entry.path();
            let metadata = entry.metadata().await?;
            let created_at = match tokio::fs::read(sidecar_path(&path)).await {
                Ok(bytes) => serde_json::from_slice::<Manifest>(&bytes)
                    .map(|m| m.created_at)
                    .ok(),
                Err(_) => None,
            };
            let created_at = match created_at {
                Some(at) => at,
                None => DateTime::<Utc>::from(metadata.modified()?),
            };

            archives.push(StoredArchive {
                name: name.to_string(),
                location: StorageLocation(path.to_string_lossy().into_owned()),
                created_at,
                size: metadata.len(),
            });
        }

        Ok(archives)
    }

    async fn delete(&self, location: &StorageLocation) -> Result<(), ArchiveError> {
        let path = self.archive_path(location)?;
        remove_if_exists(&sidecar_path(&path)).await?;
        remove_if_exists(&path).await?;
        Ok(())
    }
}
