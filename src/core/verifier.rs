use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

use crate::core::archive::{HashingReader, MANIFEST_ENTRY, VOLUME_PREFIX};
use crate::core::models::Manifest;

/// Result of a successful verification
#[derive(Debug)]
pub struct VerifyResult {
    pub manifest: Manifest,
    pub volumes_verified: u64,
    pub bytes_verified: u64,
}

/// Details of an archive entry that failed verification
#[derive(Debug)]
pub struct EntryMismatch {
    pub entry: String,
    pub reason: MismatchReason,
}

/// Reason an entry failed verification
#[derive(Debug)]
pub enum MismatchReason {
    /// BLAKE3 hash of the entry differs from the manifest
    HashMismatch,
    /// Entry size differs from the manifest
    SizeMismatch { expected: u64, actual: u64 },
    /// Manifest lists an entry the archive does not contain
    MissingInArchive,
    /// Archive contains a volume entry the manifest does not list
    UnlistedEntry,
}

struct EntryDigest {
    size: u64,
    checksum: String,
}

/// Verify an archive file against its embedded manifest.
///
/// Reads only the archive itself, so it works without the container runtime
/// and long after the job that produced it.
///
/// Returns Ok if every volume matches, Err with details if any mismatches found.
pub async fn verify_archive(path: &Path) -> Result<VerifyResult> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || verify_archive_sync(&path)).await?
}

fn verify_archive_sync(path: &Path) -> Result<VerifyResult> {
    info!(archive = %path.display(), "Starting archive verification");

    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = tar::Archive::new(std::io::BufReader::with_capacity(128 * 1024, file));

    let mut digests: BTreeMap<String, EntryDigest> = BTreeMap::new();
    let mut manifest: Option<Manifest> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();

        if name == MANIFEST_ENTRY {
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw)?;
            manifest = Some(
                serde_json::from_slice(&raw).context("manifest.json is not a valid manifest")?,
            );
            continue;
        }

        if !name.starts_with(VOLUME_PREFIX) {
            debug!(entry = %name, "Skipping non-volume entry");
            continue;
        }

        let mut reader = HashingReader::new(&mut entry);
        std::io::copy(&mut reader, &mut std::io::sink())?;
        let (size, checksum) = reader.finish();
        debug!(entry = %name, size, "Hashed entry");
        digests.insert(name, EntryDigest { size, checksum });
    }

    let Some(manifest) = manifest else {
        bail!("{} has no {}", path.display(), MANIFEST_ENTRY);
    };

    let mut mismatches: Vec<EntryMismatch> = Vec::new();
    let mut bytes_verified: u64 = 0;

    for listed in &manifest.volumes {
        let Some(digest) = digests.remove(&listed.entry) else {
            mismatches.push(EntryMismatch {
                entry: listed.entry.clone(),
                reason: MismatchReason::MissingInArchive,
            });
            continue;
        };

        if digest.size != listed.size {
            mismatches.push(EntryMismatch {
                entry: listed.entry.clone(),
                reason: MismatchReason::SizeMismatch {
                    expected: listed.size,
                    actual: digest.size,
                },
            });
        } else if digest.checksum != listed.checksum {
            mismatches.push(EntryMismatch {
                entry: listed.entry.clone(),
                reason: MismatchReason::HashMismatch,
            });
        } else {
            bytes_verified += digest.size;
        }
    }

    for entry in digests.into_keys() {
        mismatches.push(EntryMismatch {
            entry,
            reason: MismatchReason::UnlistedEntry,
        });
    }

    if !mismatches.is_empty() {
        info!(
            archive = %manifest.archive,
            mismatches = mismatches.len(),
            "Verification failed"
        );
        bail!(format_mismatch_error(&mismatches));
    }

    let volumes_verified = manifest.volumes.len() as u64;
    info!(
        archive = %manifest.archive,
        volumes_verified,
        bytes_verified,
        "Verification complete"
    );

    Ok(VerifyResult {
        manifest,
        volumes_verified,
        bytes_verified,
    })
}

/// Format mismatch errors into a human-readable message
fn format_mismatch_error(mismatches: &[EntryMismatch]) -> String {
    let mut msg = format!(
        "Verification failed: {} entry(s) did not match",
        mismatches.len()
    );

    // Show details for first 10 mismatches
    for m in mismatches.iter().take(10) {
        let reason = match &m.reason {
            MismatchReason::HashMismatch => "hash mismatch".to_string(),
            MismatchReason::SizeMismatch { expected, actual } => {
                format!("size mismatch (expected {}, found {})", expected, actual)
            }
            MismatchReason::MissingInArchive => "missing in archive".to_string(),
            MismatchReason::UnlistedEntry => "not listed in manifest".to_string(),
        };
        msg.push_str(&format!("\n  - {}: {}", m.entry, reason));
    }

    if mismatches.len() > 10 {
        msg.push_str(&format!("\n  ... and {} more", mismatches.len() - 10));
    }

    msg
}
