//! Retention sweep over a target's stored archives.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::models::RetentionPolicy;
use crate::core::storage::{StorageSink, StoredArchive};
use crate::error::ArchiveError;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
}

/// Archives the policy would delete, newest first.
///
/// The newest `keep_last` archives are always kept. Beyond those, archives
/// older than `max_age_days` are deleted, or all of them when no age limit is
/// set. `keep_last = 0` without an age limit keeps everything.
pub fn select_expired(
    mut archives: Vec<StoredArchive>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> (Vec<StoredArchive>, Vec<StoredArchive>) {
    if policy.keep_last == 0 && policy.max_age_days.is_none() {
        return (archives, Vec::new());
    }

    archives.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });

    let cutoff = policy
        .max_age_days
        .map(|days| now - Duration::days(i64::from(days)));

    let mut kept = Vec::new();
    let mut expired = Vec::new();
    for (index, archive) in archives.into_iter().enumerate() {
        let protected = index < policy.keep_last;
        let too_old = match cutoff {
            Some(cutoff) => archive.created_at < cutoff,
            None => true,
        };
        if protected || !too_old {
            kept.push(archive);
        } else {
            expired.push(archive);
        }
    }
    (kept, expired)
}

/// Apply `policy` to the archives stored for `target_id`.
///
/// Safe to run repeatedly: a second sweep finds nothing left to delete.
pub async fn sweep(
    sink: &dyn StorageSink,
    target_id: &str,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<SweepReport, ArchiveError> {
    let archives = sink.list(target_id).await?;
    let (kept, expired) = select_expired(archives, policy, now);

    let mut report = SweepReport {
        kept: kept.into_iter().map(|a| a.name).collect(),
        deleted: Vec::with_capacity(expired.len()),
    };

    for archive in expired {
        debug!(target_id = %target_id, archive = %archive.name, "Deleting expired archive");
        sink.delete(&archive.location).await?;
        report.deleted.push(archive.name);
    }

    if !report.deleted.is_empty() {
        info!(
            target_id = %target_id,
            deleted = report.deleted.len(),
            kept = report.kept.len(),
            "Retention sweep complete"
        );
    }

    Ok(report)
}
