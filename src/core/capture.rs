//! Streaming a volume out of a container into a job-private spool file.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::core::models::{CaptureResult, ContainerRef, VolumeSpec};
use crate::core::runtime::{ContainerRuntime, CopyStream};
use crate::error::{ArchiveError, BackupError, RuntimeError, RuntimeOperation};
use crate::logging::LogThrottle;

/// Buffer size for stream copies (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// Copy `volume` out of `container` into `spool`, hashing as it goes.
///
/// The spool is truncated first so a retried capture starts from scratch.
pub async fn capture_volume(
    runtime: &dyn ContainerRuntime,
    container: &ContainerRef,
    volume: &VolumeSpec,
    spool: &Path,
) -> Result<CaptureResult, BackupError> {
    let CopyStream {
        mut reader,
        expected_len,
        completion,
    } = runtime.copy_out(container, &volume.path).await?;

    let mut file = tokio::fs::File::create(spool)
        .await
        .map_err(ArchiveError::from)?;

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes: u64 = 0;
    let mut throttle = LogThrottle::new(Duration::from_secs(5));

    loop {
        let n = reader.read(&mut buffer).await.map_err(|e| {
            RuntimeError::new(
                container.name.clone(),
                RuntimeOperation::CopyOut,
                format!("reading {}: {}", volume.path, e),
            )
        })?;
        if n == 0 {
            break;
        }

        hasher.update(&buffer[..n]);
        file.write_all(&buffer[..n])
            .await
            .map_err(ArchiveError::from)?;
        bytes += n as u64;

        if throttle.tick() {
            debug!(volume = %volume.name, bytes, "Capture progress");
        }
    }

    file.flush().await.map_err(ArchiveError::from)?;
    file.sync_all().await.map_err(ArchiveError::from)?;
    drop(file);

    completion.await?;

    if let Some(expected) = expected_len {
        if expected != bytes {
            return Err(BackupError::CaptureIntegrity {
                volume: volume.name.clone(),
                detail: format!("runtime announced {} bytes but stream had {}", expected, bytes),
            });
        }
    }

    let checksum = hasher.finalize().to_hex().to_string();
    debug!(volume = %volume.name, bytes, checksum = %checksum, "Volume captured");

    Ok(CaptureResult {
        volume: volume.clone(),
        bytes,
        checksum,
        succeeded: true,
        spool: spool.to_path_buf(),
    })
}
