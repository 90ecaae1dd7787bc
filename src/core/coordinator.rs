//! Admission and supervision of backup jobs.
//!
//! Every trigger, scheduled or manual, goes through [`JobCoordinator::on_trigger`].
//! Admission takes the target's lock or rejects the trigger outright; rejected
//! triggers are never queued. Admitted jobs run on a `TaskTracker` and wait for
//! a semaphore permit before leaving `Pending`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, broadcast};
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::core::job::JobRunner;
use crate::core::locks::TargetLocks;
use crate::core::models::{BackupTarget, Job, JobOutcome, QuiesceAction};
use crate::core::notifications::{JobEvent, NotificationChannel};
use crate::core::retention;
use crate::db;

/// Upper bound for each forced resume issued at the end of shutdown.
const FORCED_RESUME_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Schedule,
    Manual,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    AlreadyRunning { job_id: String },
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Admission {
    Admitted { job_id: String },
    Rejected { reason: RejectReason },
}

impl Admission {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Admission::Admitted { job_id } => Some(job_id),
            Admission::Rejected { .. } => None,
        }
    }
}

/// Outcome of [`JobCoordinator::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// All jobs finished within the timeout.
    pub clean: bool,
    pub forced_resumes: usize,
    pub forced_resume_failures: usize,
}

pub struct JobCoordinator {
    locks: TargetLocks,
    semaphore: Arc<Semaphore>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    runner: Arc<JobRunner>,
    db: Option<Connection>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    finished: broadcast::Sender<Job>,
}

impl JobCoordinator {
    pub fn new(
        runner: Arc<JobRunner>,
        max_concurrent_jobs: usize,
        db: Option<Connection>,
        notifier: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        let (finished, _) = broadcast::channel(64);
        Self {
            locks: TargetLocks::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            runner,
            db,
            notifier,
            finished,
        }
    }

    pub fn locks(&self) -> &TargetLocks {
        &self.locks
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Finished jobs, delivered after their history is written and the lock released.
    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.finished.subscribe()
    }

    pub fn running_count(&self) -> usize {
        self.locks.held_count()
    }

    /// Admit a job for `target`, or reject the trigger.
    ///
    /// Never blocks: the job waits for a worker slot inside its own task.
    pub fn on_trigger(&self, target: Arc<BackupTarget>, source: TriggerSource) -> Admission {
        if self.cancel.is_cancelled() {
            info!(target_id = %target.id, source = %source, "Shutting down, trigger rejected");
            return Admission::Rejected {
                reason: RejectReason::ShuttingDown,
            };
        }

        let mut job = Job::new(&target);
        let Some(lock) = self.locks.try_acquire(&target.id, &job.id) else {
            let holder = self.locks.holder(&target.id).unwrap_or_default();
            info!(
                target_id = %target.id,
                source = %source,
                running_job = %holder,
                "Target already has a running job, skipping trigger"
            );
            return Admission::Rejected {
                reason: RejectReason::AlreadyRunning { job_id: holder },
            };
        };

        let job_id = job.id.clone();
        info!(target_id = %target.id, job_id = %job_id, source = %source, "Job admitted");

        let runner = self.runner.clone();
        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let finished = self.finished.clone();
        let tasks = self.tasks.clone();

        self.tasks.spawn(async move {
            if let Some(conn) = &db {
                if let Err(e) = db::jobs::create(conn, &job, source.as_str()).await {
                    warn!(job_id = %job.id, error = %e, "Failed to record job start");
                }
            }
            notify(&notifier, JobEvent::started(&job));

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };

            runner.run(&mut job, &target, &lock, &cancel).await;
            drop(permit);

            if let Some(conn) = &db {
                if let Err(e) = db::jobs::finish(conn, &job).await {
                    error!(job_id = %job.id, error = %e, "Failed to record job result");
                }
            }
            if let Some(event) = JobEvent::finished(&job) {
                notify(&notifier, event);
            }
            drop(lock);

            if job.outcome == Some(JobOutcome::Succeeded) {
                let sink = runner.builder().sink().clone();
                let target = target.clone();
                tasks.spawn(async move {
                    if let Err(e) =
                        retention::sweep(&*sink, &target.id, &target.retention, Utc::now()).await
                    {
                        warn!(target_id = %target.id, error = %e, "Retention sweep failed");
                    }
                });
            }

            // no subscribers is fine
            let _ = finished.send(job);
        });

        Admission::Admitted { job_id }
    }

    /// Refuse new triggers, abort running jobs and wait for them to resume
    /// their containers. Containers still quiesced after `timeout` get a
    /// best-effort forced resume.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        info!(running = self.running_count(), "Stopping job coordinator");
        self.cancel.cancel();
        self.tasks.close();

        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok() {
            info!("All jobs finished");
            return ShutdownReport {
                clean: true,
                ..Default::default()
            };
        }

        let stuck = self.locks.quiesced();
        warn!(
            timeout_secs = timeout.as_secs(),
            quiesced = stuck.len(),
            "Jobs did not finish in time, forcing resume"
        );

        let mut report = ShutdownReport::default();
        let runtime = self.runner.runtime();
        for entry in stuck {
            let result = tokio::time::timeout(FORCED_RESUME_TIMEOUT, async {
                match entry.action {
                    QuiesceAction::Pause => runtime.unpause(&entry.container).await,
                    QuiesceAction::Stop => runtime.start(&entry.container).await,
                    QuiesceAction::Ignore => Ok(()),
                }
            })
            .await;

            report.forced_resumes += 1;
            match result {
                Ok(Ok(())) => {
                    info!(target_id = %entry.target_id, job_id = %entry.job_id, "Forced resume succeeded")
                }
                Ok(Err(e)) => {
                    report.forced_resume_failures += 1;
                    error!(target_id = %entry.target_id, job_id = %entry.job_id, error = %e, "Forced resume failed");
                }
                Err(_) => {
                    report.forced_resume_failures += 1;
                    error!(target_id = %entry.target_id, job_id = %entry.job_id, "Forced resume timed out");
                }
            }
        }
        report
    }
}

fn notify(notifier: &Option<Arc<dyn NotificationChannel>>, event: JobEvent) {
    let Some(notifier) = notifier.clone() else {
        return;
    };
    tokio::spawn(async move {
        let job_id = event.job_id().to_string();
        if let Err(e) = notifier.notify(event).await {
            warn!(job_id = %job_id, error = %e, "Failed to send notification");
        }
    });
}
