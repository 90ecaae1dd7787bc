//! The per-job phase sequence.
//!
//! `JobRunner::run` drives one job from `Pending` to a terminal phase. Every
//! forward phase exits through `Resuming`, which runs exactly once and is
//! never cancelled, so a quiesced container is always handed back.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::archive::{ArchiveBuilder, entry_component};
use crate::core::capture::capture_volume;
use crate::core::locks::TargetLock;
use crate::core::models::{
    BackupTarget, ContainerState, HookCommand, Job, JobPhase, QuiesceAction,
};
use crate::core::progress::JobTracker;
use crate::core::retry::{abortable, retry, with_timeout};
use crate::core::runtime::{ContainerRuntime, ExecCommand};
use crate::error::{ArchiveError, BackupError, RuntimeError, RuntimeOperation};

/// What the forward phases changed, consumed by `Resuming`.
#[derive(Debug, Default)]
struct RunState {
    initial: Option<ContainerState>,
    applied: Option<QuiesceAction>,
}

pub struct JobRunner {
    runtime: Arc<dyn ContainerRuntime>,
    builder: Arc<ArchiveBuilder>,
    staging_root: PathBuf,
    tracker: JobTracker,
}

impl JobRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<ArchiveBuilder>,
        staging_root: PathBuf,
        tracker: JobTracker,
    ) -> Self {
        Self {
            runtime,
            builder,
            staging_root,
            tracker,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn builder(&self) -> &Arc<ArchiveBuilder> {
        &self.builder
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Run `job` to completion. The job is terminal when this returns.
    pub async fn run(
        &self,
        job: &mut Job,
        target: &BackupTarget,
        lock: &TargetLock,
        cancel: &CancellationToken,
    ) {
        self.tracker.register(job, target.volumes.len()).await;

        let mut state = RunState::default();
        let failure = match self.forward(job, target, lock, cancel, &mut state).await {
            Ok(()) => None,
            Err(e) => {
                let phase = job.phase;
                if e.is_abort() {
                    warn!(target_id = %job.target_id, job_id = %job.id, phase = %phase, "Job aborted");
                } else {
                    error!(target_id = %job.target_id, job_id = %job.id, phase = %phase, error = %e, "Job phase failed");
                }
                job.record_failure(phase, &e);
                self.advance(job, JobPhase::Failing).await;
                Some(e)
            }
        };

        self.advance(job, JobPhase::Resuming).await;
        let resumed = match self.resume(job, target, lock, state.applied).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    target_id = %job.target_id,
                    job_id = %job.id,
                    container = %target.container,
                    error = %e,
                    "Failed to resume container"
                );
                job.resume_error = Some(e.to_string());
                job.record_failure(JobPhase::Resuming, &e);
                false
            }
        };

        let terminal = match failure {
            Some(e) if e.is_abort() => JobPhase::Aborted,
            Some(_) => JobPhase::Failed,
            None if !resumed => JobPhase::Failed,
            None => self.post_hook(job, target, cancel, state.initial).await,
        };
        self.advance(job, terminal).await;
        self.tracker.remove(&job.id).await;

        info!(
            target_id = %job.target_id,
            job_id = %job.id,
            phase = %job.phase,
            outcome = ?job.outcome,
            attempts = job.attempts,
            "Job finished"
        );
    }

    async fn advance(&self, job: &mut Job, next: JobPhase) {
        match job.transition(next) {
            Ok(()) => self.tracker.set_phase(&job.id, next).await,
            Err(e) => error!(target_id = %job.target_id, job_id = %job.id, error = %e, "Rejected phase change"),
        }
    }

    async fn step(&self, job: &mut Job, next: JobPhase) -> Result<(), BackupError> {
        job.transition(next)?;
        self.tracker.set_phase(&job.id, next).await;
        Ok(())
    }

    async fn forward(
        &self,
        job: &mut Job,
        target: &BackupTarget,
        lock: &TargetLock,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<(), BackupError> {
        let runtime = &*self.runtime;
        let container = &target.container;

        // Pending
        let initial = abortable(
            JobPhase::Pending,
            cancel,
            with_timeout(JobPhase::Pending, target.timeouts.quiesce, async {
                Ok::<_, BackupError>(runtime.inspect(container).await?)
            }),
        )
        .await?;
        state.initial = Some(initial);
        debug!(target_id = %job.target_id, job_id = %job.id, state = initial.as_str(), "Container inspected");

        tokio::fs::create_dir_all(&self.staging_root)
            .await
            .map_err(ArchiveError::from)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", job.id))
            .tempdir_in(&self.staging_root)
            .map_err(ArchiveError::from)?;

        if let Some(hook) = &target.pre_hook {
            if initial == ContainerState::Running {
                self.step(job, JobPhase::PreHook).await?;
                self.run_hook(job, target, hook, JobPhase::PreHook, Some(cancel))
                    .await?;
            } else {
                info!(
                    target_id = %job.target_id,
                    job_id = %job.id,
                    state = initial.as_str(),
                    "Container not running, skipping pre-hook"
                );
            }
        }

        self.step(job, JobPhase::Quiescing).await?;
        if let Some(action) = plan_quiesce(target, initial)? {
            // recorded before the call so a half-applied quiesce is still undone
            state.applied = Some(action);
            lock.mark_quiesced(container.clone(), action);
            abortable(
                JobPhase::Quiescing,
                cancel,
                with_timeout(JobPhase::Quiescing, target.timeouts.quiesce, async {
                    match action {
                        QuiesceAction::Pause => runtime.pause(container).await?,
                        QuiesceAction::Stop => runtime.stop(container).await?,
                        QuiesceAction::Ignore => {}
                    }
                    Ok::<(), BackupError>(())
                }),
            )
            .await?;
        }

        self.step(job, JobPhase::Capturing).await?;
        for (index, volume) in target.volumes.iter().enumerate() {
            let spool = staging
                .path()
                .join(format!("{:02}-{}.spool", index, entry_component(&volume.name)));
            let spool = spool.as_path();
            let limit = target.timeouts.capture;

            let capture = retry(
                &target.retry.capture,
                JobPhase::Capturing,
                Some(cancel),
                &mut job.attempts,
                |_| async move {
                    abortable(
                        JobPhase::Capturing,
                        cancel,
                        with_timeout(
                            JobPhase::Capturing,
                            limit,
                            capture_volume(runtime, container, volume, spool),
                        ),
                    )
                    .await
                },
            )
            .await?;

            info!(
                target_id = %job.target_id,
                job_id = %job.id,
                volume = %volume.name,
                bytes = capture.bytes,
                "Volume captured"
            );
            self.tracker.record_capture(&job.id, capture.bytes).await;
            job.captures.push(capture);
        }

        self.step(job, JobPhase::Archiving).await?;
        let packed = abortable(
            JobPhase::Archiving,
            cancel,
            with_timeout(
                JobPhase::Archiving,
                target.timeouts.archive,
                self.builder.pack(job, &job.captures, staging.path()),
            ),
        )
        .await?;
        // once the sink write starts it runs to completion or its own timeout
        let archive = with_timeout(
            JobPhase::Archiving,
            target.timeouts.archive,
            self.builder.store(job, packed),
        )
        .await?;
        job.archive = Some(archive);

        Ok(())
    }

    async fn run_hook(
        &self,
        job: &mut Job,
        target: &BackupTarget,
        hook: &HookCommand,
        phase: JobPhase,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), BackupError> {
        let runtime = &*self.runtime;
        let container = &target.container;
        let command = &ExecCommand {
            command: hook.command.clone(),
            user: hook.user.clone(),
        };
        let limit = target.timeouts.hook;

        retry(&target.retry.hook, phase, cancel, &mut job.attempts, |attempt| async move {
            let exec = with_timeout(phase, limit, async {
                let output = runtime.exec(container, command).await?;
                debug!(
                    container = %container,
                    phase = %phase,
                    attempt,
                    exit_code = output.exit_code,
                    output = %output.output.trim_end(),
                    "Hook finished"
                );
                if hook.exit_codes.accepts(output.exit_code) {
                    Ok(())
                } else {
                    Err(BackupError::HookRejected {
                        command: hook.command.clone(),
                        exit_code: output.exit_code,
                    })
                }
            });
            match cancel {
                Some(token) => abortable(phase, token, exec).await,
                None => exec.await,
            }
        })
        .await
    }

    /// Restore what quiescing changed. Not cancellable.
    async fn resume(
        &self,
        job: &mut Job,
        target: &BackupTarget,
        lock: &TargetLock,
        applied: Option<QuiesceAction>,
    ) -> Result<(), BackupError> {
        let Some(action) = applied else {
            return Ok(());
        };
        let runtime = &*self.runtime;
        let container = &target.container;
        let limit = target.timeouts.resume;

        retry(
            &target.retry.resume,
            JobPhase::Resuming,
            None,
            &mut job.attempts,
            |_| async move {
                with_timeout(JobPhase::Resuming, limit, async {
                    match action {
                        QuiesceAction::Pause => runtime.unpause(container).await?,
                        QuiesceAction::Stop => runtime.start(container).await?,
                        QuiesceAction::Ignore => {}
                    }
                    Ok::<(), BackupError>(())
                })
                .await
            },
        )
        .await?;

        lock.clear_quiesced();
        info!(
            target_id = %job.target_id,
            job_id = %job.id,
            container = %container,
            "Container resumed"
        );
        Ok(())
    }

    /// Runs the post hook if one applies and returns the terminal phase.
    async fn post_hook(
        &self,
        job: &mut Job,
        target: &BackupTarget,
        cancel: &CancellationToken,
        initial: Option<ContainerState>,
    ) -> JobPhase {
        let Some(hook) = &target.post_hook else {
            return JobPhase::Succeeded;
        };
        if initial != Some(ContainerState::Running) {
            info!(target_id = %job.target_id, job_id = %job.id, "Container was not running, skipping post-hook");
            return JobPhase::Succeeded;
        }

        self.advance(job, JobPhase::PostHook).await;
        match self
            .run_hook(job, target, hook, JobPhase::PostHook, Some(cancel))
            .await
        {
            Ok(()) => JobPhase::Succeeded,
            Err(e) => {
                error!(target_id = %job.target_id, job_id = %job.id, error = %e, "Post-hook failed");
                job.record_failure(JobPhase::PostHook, &e);
                if e.is_abort() {
                    JobPhase::Aborted
                } else {
                    JobPhase::Failed
                }
            }
        }
    }
}

/// Decide how to quiesce a container found in `state`.
///
/// Only a running container is changed. Stopping a paused container is refused.
fn plan_quiesce(
    target: &BackupTarget,
    state: ContainerState,
) -> Result<Option<QuiesceAction>, BackupError> {
    match (target.quiesce, state) {
        (QuiesceAction::Ignore, _) => Ok(None),
        (QuiesceAction::Stop, ContainerState::Paused) => Err(RuntimeError::new(
            target.container.name.clone(),
            RuntimeOperation::Stop,
            "container is paused and cannot be stopped",
        )
        .into()),
        (action, ContainerState::Running) => Ok(Some(action)),
        (_, _) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{
        ContainerRef, PhaseTimeouts, RetentionPolicy, RetryPolicies, RetryPolicy,
    };
    use std::time::Duration;

    fn target(quiesce: QuiesceAction) -> BackupTarget {
        let retry = RetryPolicy::once();
        let timeout = Duration::from_secs(1);
        BackupTarget {
            id: "db".into(),
            container: ContainerRef {
                id: "c1".into(),
                name: "db".into(),
            },
            schedule: "* * * * *".into(),
            volumes: Vec::new(),
            pre_hook: None,
            post_hook: None,
            quiesce,
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
        }
    }

    #[test]
    fn only_running_containers_are_quiesced() {
        let pause = target(QuiesceAction::Pause);
        assert_eq!(
            plan_quiesce(&pause, ContainerState::Running).unwrap(),
            Some(QuiesceAction::Pause)
        );
        assert_eq!(plan_quiesce(&pause, ContainerState::Paused).unwrap(), None);
        assert_eq!(plan_quiesce(&pause, ContainerState::Stopped).unwrap(), None);

        let ignore = target(QuiesceAction::Ignore);
        assert_eq!(plan_quiesce(&ignore, ContainerState::Running).unwrap(), None);
    }

    #[test]
    fn stopping_a_paused_container_is_refused() {
        let stop = target(QuiesceAction::Stop);
        assert!(plan_quiesce(&stop, ContainerState::Paused).is_err());
        assert_eq!(plan_quiesce(&stop, ContainerState::Stopped).unwrap(), None);
        assert_eq!(
            plan_quiesce(&stop, ContainerState::Running).unwrap(),
            Some(QuiesceAction::Stop)
        );
    }
}
