use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::models::Job;

/// A job as stored in history.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub target_id: String,
    pub container: String,
    pub trigger: String,
    pub phase: String,
    pub outcome: Option<String>,
    pub attempts: u32,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub archive_name: Option<String>,
    pub archive_location: Option<String>,
    pub total_size: Option<u64>,
    pub error_phase: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub resume_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusEntry {
    pub status: String,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobWithHistory {
    #[serde(flatten)]
    pub job: JobRecord,
    /// Captured volumes as recorded at completion.
    pub captures: serde_json::Value,
    pub history: Vec<JobStatusEntry>,
}

const JOB_COLUMNS: &str = "id, target_id, container, trigger, phase, outcome, attempts,
    started_at, finished_at, archive_name, archive_location, total_size,
    error_phase, error_kind, error_message, resume_error";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        target_id: row.get(1)?,
        container: row.get(2)?,
        trigger: row.get(3)?,
        phase: row.get(4)?,
        outcome: row.get(5)?,
        attempts: row.get(6)?,
        started_at: row.get(7)?,
        finished_at: row.get(8)?,
        archive_name: row.get(9)?,
        archive_location: row.get(10)?,
        total_size: row.get::<_, Option<i64>>(11)?.map(|v| v.max(0) as u64),
        error_phase: row.get(12)?,
        error_kind: row.get(13)?,
        error_message: row.get(14)?,
        resume_error: row.get(15)?,
    })
}

/// Record a newly admitted job.
pub async fn create(conn: &Connection, job: &Job, trigger: &str) -> Result<()> {
    let id = job.id.clone();
    let target_id = job.target_id.clone();
    let container = job.container.name.clone();
    let phase = job.phase.to_string();
    let started_at = timestamp(job.started_at);
    let trigger = trigger.to_string();

    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO jobs (id, target_id, container, trigger, phase, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![&id, &target_id, &container, &trigger, &phase, &started_at],
        )?;

        let log_id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO job_status_log (id, job_id, status, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                log_id,
                &id,
                &phase,
                format!("Job admitted ({})", trigger),
                &started_at
            ],
        )?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Write the terminal state of `job` and its phase log.
pub async fn finish(conn: &Connection, job: &Job) -> Result<()> {
    let job = job.clone();
    let captures = serde_json::to_string(&job.captures)?;

    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "UPDATE jobs SET
                phase = ?2, outcome = ?3, attempts = ?4, finished_at = ?5,
                archive_name = ?6, archive_location = ?7, total_size = ?8, captures = ?9,
                error_phase = ?10, error_kind = ?11, error_message = ?12, resume_error = ?13
             WHERE id = ?1",
            params![
                &job.id,
                job.phase.as_str(),
                job.outcome.map(|o| o.phase().as_str()),
                job.attempts,
                job.finished_at.map(timestamp),
                job.archive.as_ref().map(|a| a.name.clone()),
                job.archive.as_ref().map(|a| a.location.0.clone()),
                job.archive.as_ref().map(|a| a.total_size as i64),
                captures,
                job.error.as_ref().map(|e| e.phase.as_str()),
                job.error.as_ref().map(|e| e.kind.clone()),
                job.error.as_ref().map(|e| e.message.clone()),
                &job.resume_error,
            ],
        )?;

        for change in job.transitions.iter().skip(1) {
            let description = match &job.error {
                Some(failure) if change.phase == job.phase && job.phase.is_terminal() => {
                    Some(failure.message.clone())
                }
                _ => None,
            };
            tx.execute(
                "INSERT INTO job_status_log (id, job_id, status, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::now_v7().to_string(),
                    &job.id,
                    change.phase.as_str(),
                    description,
                    timestamp(change.at)
                ],
            )?;
        }

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Most recent jobs first, optionally for one target.
pub async fn list(
    conn: &Connection,
    target_id: Option<String>,
    limit: usize,
) -> Result<Vec<JobRecord>> {
    conn.call(move |c| {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE (?1 IS NULL OR target_id = ?1)
             ORDER BY started_at DESC, id DESC
             LIMIT ?2",
            JOB_COLUMNS
        );
        let mut stmt = c.prepare(&sql)?;
        let rows = stmt.query_map(params![target_id, limit as i64], read_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to list jobs: {}", e))
}

pub async fn get_with_history(conn: &Connection, job_id: String) -> Result<Option<JobWithHistory>> {
    conn.call(move |c| {
        let sql = format!("SELECT {}, captures FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let found = c
            .query_row(&sql, params![&job_id], |row| {
                Ok((read_record(row)?, row.get::<_, Option<String>>(16)?))
            })
            .optional()?;

        let Some((job, captures)) = found else {
            return Ok(None);
        };

        let mut stmt = c.prepare(
            "SELECT status, description, created_at FROM job_status_log
             WHERE job_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let history = stmt
            .query_map(params![&job_id], |row| {
                Ok(JobStatusEntry {
                    status: row.get(0)?,
                    description: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let captures = captures
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(serde_json::Value::Null);

        Ok::<_, rusqlite::Error>(Some(JobWithHistory {
            job,
            captures,
            history,
        }))
    })
    .await
    .map_err(|e| anyhow!("Failed to get job: {}", e))
}

/// Mark jobs left unfinished by a previous run as aborted.
///
/// Returns the number of jobs touched.
pub async fn mark_interrupted(conn: &Connection) -> Result<usize> {
    let now = timestamp(Utc::now());

    let count = conn
        .call(move |c| {
            let tx = c.transaction()?;

            let ids: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM jobs WHERE outcome IS NULL")?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            for id in &ids {
                tx.execute(
                    "UPDATE jobs SET
                        phase = 'Aborted', outcome = 'Aborted', finished_at = ?2,
                        error_phase = COALESCE(error_phase, phase),
                        error_kind = COALESCE(error_kind, 'aborted'),
                        error_message = COALESCE(error_message, 'daemon restarted')
                     WHERE id = ?1",
                    params![id, &now],
                )?;
                tx.execute(
                    "INSERT INTO job_status_log (id, job_id, status, description, created_at)
                     VALUES (?1, ?2, 'Aborted', 'daemon restarted', ?3)",
                    params![Uuid::now_v7().to_string(), id, &now],
                )?;
            }

            tx.commit()?;
            Ok::<usize, rusqlite::Error>(ids.len())
        })
        .await?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{
        BackupTarget, ContainerRef, JobPhase, PhaseTimeouts, QuiesceAction, RetentionPolicy,
        RetryPolicies, RetryPolicy,
    };
    use crate::db::open_in_memory;
    use crate::error::{BackupError, RuntimeError, RuntimeOperation};
    use std::time::Duration;

    fn job(target_id: &str) -> Job {
        let retry = RetryPolicy::once();
        let timeout = Duration::from_secs(1);
        Job::new(&BackupTarget {
            id: target_id.into(),
            container: ContainerRef {
                id: "c1".into(),
                name: target_id.into(),
            },
            schedule: "* * * * *".into(),
            volumes: Vec::new(),
            pre_hook: None,
            post_hook: None,
            quiesce: QuiesceAction::Pause,
            retry: RetryPolicies {
                hook: retry,
                capture: retry,
                resume: retry,
            },
            timeouts: PhaseTimeouts {
                hook: timeout,
                quiesce: timeout,
                capture: timeout,
                archive: timeout,
                resume: timeout,
            },
            retention: RetentionPolicy {
                keep_last: 1,
                max_age_days: None,
            },
        })
    }

    #[tokio::test]
    async fn test_create_and_finish_round_trip() {
        let conn = open_in_memory().await.unwrap();
        let mut job = job("db");
        create(&conn, &job, "schedule").await.unwrap();

        job.transition(JobPhase::Quiescing).unwrap();
        let err = BackupError::from(RuntimeError::new("db", RuntimeOperation::Pause, "denied"));
        job.record_failure(JobPhase::Quiescing, &err);
        job.transition(JobPhase::Failing).unwrap();
        job.transition(JobPhase::Resuming).unwrap();
        job.transition(JobPhase::Failed).unwrap();
        finish(&conn, &job).await.unwrap();

        let stored = get_with_history(&conn, job.id.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.job.phase, "Failed");
        assert_eq!(stored.job.outcome.as_deref(), Some("Failed"));
        assert_eq!(stored.job.error_phase.as_deref(), Some("Quiescing"));
        assert_eq!(stored.job.error_kind.as_deref(), Some("runtime"));

        let statuses: Vec<&str> = stored.history.iter().map(|h| h.status.as_str()).collect();
        assert_eq!(
            statuses,
            vec!["Pending", "Quiescing", "Failing", "Resuming", "Failed"]
        );
        assert!(stored.history.last().unwrap().description.is_some());
    }

    #[tokio::test]
    async fn test_list_filters_by_target() {
        let conn = open_in_memory().await.unwrap();
        for target in ["a", "b", "a"] {
            create(&conn, &job(target), "manual").await.unwrap();
        }

        assert_eq!(list(&conn, None, 10).await.unwrap().len(), 3);
        assert_eq!(list(&conn, Some("a".into()), 10).await.unwrap().len(), 2);
        assert_eq!(list(&conn, None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_job_is_none() {
        let conn = open_in_memory().await.unwrap();
        assert!(get_with_history(&conn, "nope".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_interrupted_aborts_unfinished_jobs() {
        let conn = open_in_memory().await.unwrap();
        let running = job("a");
        create(&conn, &running, "schedule").await.unwrap();

        let mut done = job("b");
        create(&conn, &done, "schedule").await.unwrap();
        for phase in [
            JobPhase::Quiescing,
            JobPhase::Capturing,
            JobPhase::Archiving,
            JobPhase::Resuming,
            JobPhase::Succeeded,
        ] {
            done.transition(phase).unwrap();
        }
        finish(&conn, &done).await.unwrap();

        assert_eq!(mark_interrupted(&conn).await.unwrap(), 1);
        assert_eq!(mark_interrupted(&conn).await.unwrap(), 0);

        let stored = get_with_history(&conn, running.id.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.job.outcome.as_deref(), Some("Aborted"));
        assert_eq!(stored.job.error_message.as_deref(), Some("daemon restarted"));
    }
}
