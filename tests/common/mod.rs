#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stowd::adapters::{FilesystemSink, SimulatedRuntime, Simulator};
use stowd::config::TargetDefaults;
use stowd::core::coordinator::JobCoordinator;
use stowd::core::models::{BackupTarget, ContainerState, Job, QuiesceAction, RetryPolicy};
use stowd::core::runtime::ContainerRuntime;
use stowd::core::storage::StorageSink;
use stowd::core::{ArchiveBuilder, JobRunner, JobTracker, TargetLocks, TargetRegistry};
use stowd::error::RuntimeOperation;
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

pub const DB: &str = "c-db";

pub const VOLUMES: [(&str, &[u8]); 3] = [
    ("/var/lib/db", b"rows rows rows rows"),
    ("/var/lib/wal", b"0001 0002 0003"),
    ("/etc/db", b"max_connections = 100\n"),
];

/// Simulated runtime, filesystem sink and job runner over one temp dir.
pub struct Harness {
    pub sim: Simulator,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub registry: TargetRegistry,
    pub sink: Arc<FilesystemSink>,
    pub runner: Arc<JobRunner>,
    pub tracker: JobTracker,
    pub dir: TempDir,
}

pub fn fast_defaults() -> TargetDefaults {
    TargetDefaults {
        quiesce: QuiesceAction::Pause,
        backoff_ms: 1,
        max_backoff_ms: 5,
        ..TargetDefaults::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempdir().unwrap();
        let (runtime, sim) = SimulatedRuntime::new();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
        let sink = Arc::new(FilesystemSink::new(dir.path().join("archives")));
        let sink_retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let builder = Arc::new(ArchiveBuilder::new(sink.clone(), sink_retry));
        let tracker = JobTracker::new();
        let runner = Arc::new(JobRunner::new(
            runtime.clone(),
            builder,
            dir.path().join("staging"),
            tracker.clone(),
        ));
        let registry = TargetRegistry::new(runtime.clone(), "stowd", fast_defaults());

        Self {
            sim,
            runtime,
            registry,
            sink,
            runner,
            tracker,
            dir,
        }
    }

    /// Add the `db` container with three volumes. `extra` labels override
    /// the defaults.
    pub fn add_db(&self, state: ContainerState, extra: &[(&str, &str)]) {
        self.add_container(DB, "db", state, extra);
    }

    pub fn add_container(&self, id: &str, name: &str, state: ContainerState, extra: &[(&str, &str)]) {
        let mut labels = vec![
            ("stowd.enable", "true"),
            ("stowd.schedule", "*/5 * * * *"),
            ("stowd.volumes", "data:/var/lib/db,wal:/var/lib/wal,config:/etc/db"),
        ];
        labels.extend_from_slice(extra);
        self.sim.add_container(id, name, &labels, state);
        for (path, data) in VOLUMES {
            self.sim.set_file(id, path, data.to_vec());
        }
    }

    pub async fn target(&self, id: &str) -> Arc<BackupTarget> {
        let (report, _) = self.registry.refresh().await.unwrap();
        assert!(report.rejected.is_empty(), "rejected: {:?}", report.rejected);
        self.registry.get(id).unwrap()
    }

    /// Run one job to completion outside the coordinator.
    pub async fn run(&self, target: &BackupTarget) -> Job {
        self.run_with(target, CancellationToken::new()).await
    }

    pub async fn run_with(&self, target: &BackupTarget, cancel: CancellationToken) -> Job {
        run_on(&self.runner, target, cancel).await
    }

    /// Runner over this harness's runtime and staging that stores into `sink`.
    pub fn runner_with_sink(&self, sink: Arc<dyn StorageSink>) -> JobRunner {
        let builder = Arc::new(ArchiveBuilder::new(sink, RetryPolicy::once()));
        JobRunner::new(
            self.runtime.clone(),
            builder,
            self.dir.path().join("staging"),
            self.tracker.clone(),
        )
    }

    pub fn coordinator(&self, max_concurrent_jobs: usize) -> JobCoordinator {
        JobCoordinator::new(self.runner.clone(), max_concurrent_jobs, None, None)
    }

    pub fn count(&self, operation: RuntimeOperation) -> usize {
        self.sim.count(operation, DB)
    }

    pub fn copies_of(&self, path: &str) -> usize {
        self.sim
            .calls()
            .iter()
            .filter(|c| c.operation == RuntimeOperation::CopyOut && c.detail.as_deref() == Some(path))
            .count()
    }

    pub fn staging_is_empty(&self) -> bool {
        match std::fs::read_dir(self.dir.path().join("staging")) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }
}

pub async fn run_on(runner: &JobRunner, target: &BackupTarget, cancel: CancellationToken) -> Job {
    let locks = TargetLocks::new();
    let mut job = Job::new(target);
    let lock = locks.try_acquire(&target.id, &job.id).unwrap();
    runner.run(&mut job, target, &lock, &cancel).await;
    job
}
