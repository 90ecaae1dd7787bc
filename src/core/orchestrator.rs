use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::archive::ArchiveBuilder;
use crate::core::coordinator::{Admission, JobCoordinator, TriggerSource};
use crate::core::job::JobRunner;
use crate::core::notifications::create_notifier;
use crate::core::registry::TargetRegistry;
use crate::core::runtime::ContainerRuntime;
use crate::core::scheduler::{Scheduler, UpcomingFire};
use crate::core::storage::StorageSink;
use crate::db;

pub struct Orchestrator {
    ctx: AppContext,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<TargetRegistry>,
    coordinator: Arc<JobCoordinator>,
    upcoming: watch::Sender<Vec<UpcomingFire>>,
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    pub fn new(
        ctx: AppContext,
        runtime: Arc<dyn ContainerRuntime>,
        sink: Arc<dyn StorageSink>,
    ) -> Self {
        let config = ctx.config.clone();

        let builder = Arc::new(ArchiveBuilder::new(sink, config.sink_retry()));
        let runner = Arc::new(JobRunner::new(
            runtime.clone(),
            builder,
            config.staging_directory(),
            ctx.tracker.clone(),
        ));
        let notifier = create_notifier(&config.notifications);
        if notifier.is_none() {
            debug!("Notifications disabled");
        }
        let coordinator = Arc::new(JobCoordinator::new(
            runner,
            config.max_concurrent_jobs,
            Some(ctx.db.clone()),
            notifier,
        ));
        let registry = Arc::new(TargetRegistry::new(
            runtime.clone(),
            &config.label_prefix,
            config.defaults.clone(),
        ));
        let (upcoming, _) = watch::channel(Vec::new());

        Self {
            ctx,
            runtime,
            registry,
            coordinator,
            upcoming,
            started_at: Utc::now(),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<JobCoordinator> {
        &self.coordinator
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Next fire per target as of the last scheduler pass.
    pub fn upcoming(&self) -> Vec<UpcomingFire> {
        self.upcoming.borrow().clone()
    }

    /// Start a job for `target_id` now, subject to the usual admission rules.
    ///
    /// Returns `None` when no such target is registered.
    pub fn trigger(&self, target_id: &str) -> Option<Admission> {
        let target = self.registry.get(target_id)?;
        Some(self.coordinator.on_trigger(target, TriggerSource::Manual))
    }

    /// Schedule targets until `shutdown` fires, then drain jobs.
    ///
    /// Discovery runs in its own task; this loop only syncs the scheduler
    /// from the registry and dispatches due fires.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            simulation = self.ctx.config.simulation,
            max_concurrent_jobs = self.ctx.config.max_concurrent_jobs,
            "stowd starting"
        );

        self.runtime
            .ping()
            .await
            .context("Container runtime is not reachable")?;

        let interrupted = db::jobs::mark_interrupted(&self.ctx.db)
            .await
            .context("Failed to recover interrupted jobs")?;
        if interrupted > 0 {
            warn!(count = interrupted, "Marked jobs from a previous run as aborted");
        }

        let mut scheduler = Scheduler::new();
        let interval = self.ctx.config.discovery_interval();

        // discovery talks to the runtime, so it stays off this loop
        let (passes, mut discovered) = watch::channel(0u64);
        let discovery_stop = shutdown.child_token();
        let discovery = tokio::spawn(run_discovery(
            self.registry.clone(),
            interval,
            self.ctx.config.discovery_timeout(),
            passes,
            discovery_stop.clone(),
        ));
        let mut discovery_running = true;

        loop {
            self.dispatch(&mut scheduler, Utc::now());
            self.upcoming.send_replace(scheduler.upcoming());

            let sleep_for = sleep_duration(scheduler.next_wakeup(), Utc::now(), interval);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = discovered.changed(), if discovery_running => {
                    if changed.is_ok() {
                        scheduler.sync(&self.registry.all(), Utc::now());
                    } else {
                        error!("Discovery task ended, keeping the current targets");
                        discovery_running = false;
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        info!("Shutdown requested");
        discovery_stop.cancel();
        if let Err(e) = discovery.await {
            warn!(error = %e, "Discovery task failed");
        }

        let report = self
            .coordinator
            .shutdown(self.ctx.config.shutdown_timeout())
            .await;
        if report.clean {
            info!("stowd stopped");
        } else {
            error!(
                forced_resumes = report.forced_resumes,
                failures = report.forced_resume_failures,
                "stowd stopped with jobs still running"
            );
        }
        Ok(())
    }

    fn dispatch(&self, scheduler: &mut Scheduler, now: DateTime<Utc>) {
        for event in scheduler.next_events(now) {
            let Some(target) = self.registry.get(&event.target_id) else {
                debug!(target_id = %event.target_id, "Target vanished before its fire time");
                continue;
            };
            debug!(target_id = %event.target_id, fire_time = %event.fire_time, "Schedule fired");
            self.coordinator.on_trigger(target, TriggerSource::Schedule);
        }
    }
}

/// Refresh the registry every `interval` until `stop` fires, bumping
/// `passes` after each successful pass. A pass that outlives `limit` is
/// dropped and the previous targets stay in place.
async fn run_discovery(
    registry: Arc<TargetRegistry>,
    interval: Duration,
    limit: Duration,
    passes: watch::Sender<u64>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let pass = tokio::select! {
            _ = stop.cancelled() => return,
            pass = tokio::time::timeout(limit, registry.refresh()) => pass,
        };

        match pass {
            Ok(Ok((report, _))) => {
                debug!(
                    targets = report.targets.len(),
                    rejected = report.rejected.len(),
                    "Discovery finished"
                );
                passes.send_modify(|n| *n += 1);
            }
            Ok(Err(e)) => warn!(error = %e, "Discovery failed, keeping previous targets"),
            Err(_) => warn!(
                timeout_secs = limit.as_secs(),
                "Discovery timed out, keeping previous targets"
            ),
        }
    }
}

/// Time until the next fire, capped so the loop wakes at least every `idle`.
fn sleep_duration(next_fire: Option<DateTime<Utc>>, now: DateTime<Utc>, idle: Duration) -> Duration {
    match next_fire {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(idle),
        None => idle,
    }
}
