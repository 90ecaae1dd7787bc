//! Turns a job's spooled captures into one tar archive and hands it to the sink.
//!
//! Archive layout:
//!
//! ```text
//! volumes/00-<name>.tar
//! volumes/01-<name>.tar
//! ...
//! manifest.json
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::core::models::{
    Archive, CaptureResult, Job, Manifest, ManifestEntry, RetryPolicy, StorageLocation,
    archive_name,
};
use crate::core::storage::StorageSink;
use crate::error::{ArchiveError, BackupError};

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const VOLUME_PREFIX: &str = "volumes/";

/// Archive entry mode (rw-r-----).
const ENTRY_MODE: u32 = 0o640;

/// Buffer size for re-reading spools (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// Replace anything that is not safe inside a tar entry name.
pub(crate) fn entry_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "volume".to_string()
    } else {
        cleaned.to_string()
    }
}

pub(crate) fn volume_entry(index: usize, name: &str) -> String {
    format!("{}{:02}-{}.tar", VOLUME_PREFIX, index, entry_component(name))
}

/// Reader adapter that hashes and counts everything read through it.
pub(crate) struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    pub(crate) fn finish(self) -> (u64, String) {
        (self.bytes, self.hasher.finalize().to_hex().to_string())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// A finished archive file in staging, not yet stored.
#[derive(Debug)]
pub struct PackedArchive {
    pub name: String,
    pub manifest: Manifest,
    pub path: PathBuf,
}

pub struct ArchiveBuilder {
    sink: Arc<dyn StorageSink>,
    sink_retry: RetryPolicy,
}

impl ArchiveBuilder {
    pub fn new(sink: Arc<dyn StorageSink>, sink_retry: RetryPolicy) -> Self {
        Self { sink, sink_retry }
    }

    pub fn sink(&self) -> &Arc<dyn StorageSink> {
        &self.sink
    }

    /// Build the archive for `job` in `staging` and store it.
    pub async fn build(
        &self,
        job: &Job,
        captures: &[CaptureResult],
        staging: &Path,
    ) -> Result<Archive, BackupError> {
        let packed = self.pack(job, captures, staging).await?;
        self.store(job, packed).await
    }

    /// Write the archive for `job` into `staging` without storing it.
    ///
    /// Every spool is re-hashed while it is copied in; a spool that no longer
    /// matches its capture fails the build with `CaptureIntegrity`.
    pub async fn pack(
        &self,
        job: &Job,
        captures: &[CaptureResult],
        staging: &Path,
    ) -> Result<PackedArchive, BackupError> {
        let name = archive_name(&job.target_id, job.started_at);

        let volumes: Vec<ManifestEntry> = captures
            .iter()
            .enumerate()
            .map(|(i, c)| ManifestEntry {
                name: c.volume.name.clone(),
                path: c.volume.path.clone(),
                entry: volume_entry(i, &c.volume.name),
                size: c.bytes,
                checksum: c.checksum.clone(),
            })
            .collect();
        let total_size = volumes.iter().map(|v| v.size).sum();

        let manifest = Manifest {
            archive: name.clone(),
            target_id: job.target_id.clone(),
            job_id: job.id.clone(),
            created_at: Utc::now(),
            volumes,
            total_size,
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest).map_err(ArchiveError::from)?;

        let path = staging.join(format!("{}.tar", name));
        let sources: Vec<(ManifestEntry, PathBuf)> = manifest
            .volumes
            .iter()
            .cloned()
            .zip(captures.iter().map(|c| c.spool.clone()))
            .collect();
        let mtime = job.started_at.timestamp().max(0) as u64;
        let tar_path = path.clone();

        tokio::task::spawn_blocking(move || write_tar(&tar_path, &sources, &manifest_json, mtime))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))??;

        Ok(PackedArchive {
            name,
            manifest,
            path,
        })
    }

    /// Hand a packed archive to the sink, retrying failed writes.
    pub async fn store(&self, job: &Job, packed: PackedArchive) -> Result<Archive, BackupError> {
        let PackedArchive {
            name,
            manifest,
            path,
        } = packed;
        let location = self.write_to_sink(&job.target_id, &name, &manifest, &path).await?;
        let total_size = manifest.total_size;

        info!(
            target_id = %job.target_id,
            job_id = %job.id,
            archive = %name,
            total_size,
            location = %location,
            "Archive stored"
        );

        Ok(Archive {
            name,
            manifest,
            total_size,
            location,
        })
    }

    async fn write_to_sink(
        &self,
        target_id: &str,
        name: &str,
        manifest: &Manifest,
        archive_path: &Path,
    ) -> Result<StorageLocation, ArchiveError> {
        let max_attempts = self.sink_retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let file = tokio::fs::File::open(archive_path).await?;
            let error = match self.sink.write(target_id, name, manifest, Box::pin(file)).await {
                Ok(location) => return Ok(location),
                Err(e) => e,
            };

            if matches!(error, ArchiveError::AlreadyExists(_)) || attempt >= max_attempts {
                return Err(error);
            }

            let delay = self.sink_retry.backoff_for(attempt);
            warn!(
                target_id = %target_id,
                archive = %name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Sink write failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn write_tar(
    path: &Path,
    sources: &[(ManifestEntry, PathBuf)],
    manifest_json: &[u8],
    mtime: u64,
) -> Result<(), BackupError> {
    let file = std::fs::File::create(path).map_err(ArchiveError::from)?;
    let writer = std::io::BufWriter::with_capacity(BUFFER_SIZE, file);
    let mut builder = tar::Builder::new(writer);

    for (entry, spool) in sources {
        let spool_len = std::fs::metadata(spool).map_err(ArchiveError::from)?.len();
        if spool_len != entry.size {
            return Err(BackupError::CaptureIntegrity {
                volume: entry.name.clone(),
                detail: format!(
                    "spool holds {} bytes but capture recorded {}",
                    spool_len, entry.size
                ),
            });
        }

        let spool_file = std::fs::File::open(spool).map_err(ArchiveError::from)?;
        let mut reader = HashingReader::new(
            std::io::BufReader::with_capacity(BUFFER_SIZE, spool_file).take(entry.size),
        );

        let mut header = tar::Header::new_gnu();
        header.set_size(entry.size);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(mtime);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, &entry.entry, &mut reader)
            .map_err(ArchiveError::from)?;

        let (bytes, checksum) = reader.finish();
        if bytes != entry.size || checksum != entry.checksum {
            return Err(BackupError::CaptureIntegrity {
                volume: entry.name.clone(),
                detail: "spool checksum does not match the captured stream".to_string(),
            });
        }
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_json.len() as u64);
    header.set_mode(ENTRY_MODE);
    header.set_mtime(mtime);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, MANIFEST_ENTRY, manifest_json)
        .map_err(ArchiveError::from)?;

    let mut writer = builder.into_inner().map_err(ArchiveError::from)?;
    std::io::Write::flush(&mut writer).map_err(ArchiveError::from)?;
    writer
        .into_inner()
        .map_err(|e| ArchiveError::Io(e.into_error()))?
        .sync_all()
        .map_err(ArchiveError::from)?;
    Ok(())
}
