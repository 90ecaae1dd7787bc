mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{DB, Harness};
use stowd::adapters::FilesystemSink;
use stowd::core::models::{ContainerState, JobOutcome, JobPhase, Manifest, StorageLocation};
use stowd::core::storage::{ArchiveBody, StorageSink, StoredArchive};
use stowd::core::verify_archive;
use stowd::error::{ArchiveError, RuntimeOperation};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Sink that announces each write and holds it before storing.
struct SlowSink {
    inner: Arc<FilesystemSink>,
    delay: Duration,
    started: Arc<Notify>,
}

#[async_trait]
impl StorageSink for SlowSink {
    async fn write(
        &self,
        target_id: &str,
        name: &str,
        manifest: &Manifest,
        body: ArchiveBody,
    ) -> Result<StorageLocation, ArchiveError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.inner.write(target_id, name, manifest, body).await
    }

    async fn list(&self, target_id: &str) -> Result<Vec<StoredArchive>, ArchiveError> {
        self.inner.list(target_id).await
    }

    async fn delete(&self, location: &StorageLocation) -> Result<(), ArchiveError> {
        self.inner.delete(location).await
    }
}

#[tokio::test]
async fn test_three_volume_backup_succeeds() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.phase, JobPhase::Succeeded);
    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
    assert!(job.error.is_none());
    assert_eq!(job.captures.len(), 3);
    for phase in [
        JobPhase::Quiescing,
        JobPhase::Capturing,
        JobPhase::Archiving,
        JobPhase::Resuming,
    ] {
        assert!(job.visited(phase), "never entered {}", phase);
    }
    assert!(!job.visited(JobPhase::Failing));

    let archive = job.archive.as_ref().unwrap();
    for (entry, capture) in archive.manifest.volumes.iter().zip(&job.captures) {
        assert_eq!(entry.checksum, capture.checksum);
        assert_eq!(entry.size, capture.bytes);
    }

    let stored = h.sink.list("db").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, archive.name);

    let verified = verify_archive(&h.sink.archive_path(&archive.location).unwrap())
        .await
        .unwrap();
    assert_eq!(verified.volumes_verified, 3);

    assert_eq!(h.count(RuntimeOperation::Pause), 1);
    assert_eq!(h.count(RuntimeOperation::Unpause), 1);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));
    assert!(h.staging_is_empty());
}

#[tokio::test]
async fn test_quiesce_failure_still_resumes() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    h.sim.fail_always(RuntimeOperation::Pause, DB);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Failed));
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.phase, JobPhase::Quiescing);
    assert_eq!(error.kind, "runtime");
    assert!(job.visited(JobPhase::Failing));
    assert!(job.archive.is_none());
    assert_eq!(h.count(RuntimeOperation::CopyOut), 0);
    assert_eq!(h.count(RuntimeOperation::Unpause), 1);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));
}

#[tokio::test]
async fn test_second_volume_failure_fails_job() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[("stowd.retry.capture.attempts", "2")]);
    h.sim.fail_copy(DB, "/var/lib/wal", 10);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Failed));
    assert_eq!(job.error.as_ref().unwrap().phase, JobPhase::Capturing);
    assert_eq!(job.captures.len(), 1);
    assert_eq!(h.copies_of("/var/lib/wal"), 2);
    assert_eq!(h.copies_of("/etc/db"), 0);
    assert!(h.sink.list("db").await.unwrap().is_empty());
    assert_eq!(h.count(RuntimeOperation::Unpause), 1);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));
    assert!(h.staging_is_empty());
}

#[tokio::test]
async fn test_transient_copy_failure_is_retried() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    h.sim.fail_copy(DB, "/var/lib/db", 1);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
    assert_eq!(h.copies_of("/var/lib/db"), 2);
    assert!(job.attempts >= 2);
}

#[tokio::test]
async fn test_short_stream_is_an_integrity_failure() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    h.sim.overstate_length(DB, "/etc/db", 16);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Failed));
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.phase, JobPhase::Capturing);
    assert_eq!(error.kind, "capture_integrity");
    // integrity failures are not retried
    assert_eq!(h.copies_of("/etc/db"), 1);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));
}

#[tokio::test]
async fn test_abort_during_capture_resumes_container() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    h.sim
        .delay(RuntimeOperation::CopyOut, DB, Duration::from_secs(30), None);
    let target = h.target("db").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let job = tokio::time::timeout(Duration::from_secs(5), h.run_with(&target, cancel))
        .await
        .expect("job did not stop after cancellation");

    assert_eq!(job.phase, JobPhase::Aborted);
    assert_eq!(job.outcome, Some(JobOutcome::Aborted));
    assert_eq!(job.error.as_ref().unwrap().phase, JobPhase::Capturing);
    assert_eq!(h.count(RuntimeOperation::Unpause), 1);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));
}

#[tokio::test]
async fn test_hung_capture_times_out_and_resumes() {
    let h = Harness::new();
    h.add_db(
        ContainerState::Running,
        &[
            ("stowd.timeout.capture_secs", "1"),
            ("stowd.retry.capture.attempts", "1"),
        ],
    );
    h.sim
        .delay(RuntimeOperation::CopyOut, DB, Duration::from_secs(30), None);
    let target = h.target("db").await;

    let job = tokio::time::timeout(Duration::from_secs(5), h.run(&target))
        .await
        .expect("capture timeout did not fire");

    assert_eq!(job.phase, JobPhase::Failed);
    assert_eq!(job.outcome, Some(JobOutcome::Failed));
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.phase, JobPhase::Capturing);
    assert_eq!(error.kind, "timeout");
    assert!(job.visited(JobPhase::Failing));
    assert!(job.visited(JobPhase::Resuming));
    assert!(job.archive.is_none());
    assert_eq!(h.copies_of("/var/lib/db"), 1);
    assert_eq!(h.count(RuntimeOperation::Unpause), 1);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));
    assert!(h.staging_is_empty());
}

#[tokio::test]
async fn test_abort_during_sink_write_keeps_stored_archive() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    let target = h.target("db").await;
    let started = Arc::new(Notify::new());
    let runner = h.runner_with_sink(Arc::new(SlowSink {
        inner: h.sink.clone(),
        delay: Duration::from_millis(300),
        started: started.clone(),
    }));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        started.notified().await;
        trigger.cancel();
    });

    let run = common::run_on(&runner, &target, cancel);
    let job = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("job did not finish");

    // the write had started, so it completes and the job keeps the result
    let stored = h.sink.list("db").await.unwrap();
    assert_eq!(stored.len(), 1);
    let archive = job.archive.as_ref().expect("stored archive was not recorded");
    assert_eq!(archive.name, stored[0].name);
    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
    assert_eq!(h.count(RuntimeOperation::Unpause), 1);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));

    let leftovers: Vec<_> = std::fs::read_dir(h.dir.path().join("archives/db"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "partial files left: {:?}", leftovers);
}

#[tokio::test]
async fn test_pre_hook_failure_skips_quiesce() {
    let h = Harness::new();
    h.add_db(
        ContainerState::Running,
        &[
            ("stowd.hook.pre", "flush-tables"),
            ("stowd.action", "pause"),
            ("stowd.retry.hook.attempts", "1"),
        ],
    );
    h.sim.set_exit_code(DB, "flush-tables", 1);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Failed));
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.phase, JobPhase::PreHook);
    assert_eq!(error.kind, "hook_rejected");
    assert_eq!(h.count(RuntimeOperation::Exec), 1);
    assert_eq!(h.count(RuntimeOperation::Pause), 0);
    assert_eq!(h.count(RuntimeOperation::Unpause), 0);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));
}

#[tokio::test]
async fn test_accepted_hook_exit_codes() {
    let h = Harness::new();
    h.add_db(
        ContainerState::Running,
        &[
            ("stowd.hook.pre", "dump"),
            ("stowd.hook.exit_codes", "0,2-3"),
        ],
    );
    h.sim.set_exit_code(DB, "dump", 3);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
    assert!(job.visited(JobPhase::PreHook));
    // hooks default the quiesce action to ignore
    assert_eq!(h.count(RuntimeOperation::Pause), 0);
}

#[tokio::test]
async fn test_post_hook_failure_keeps_archive() {
    let h = Harness::new();
    h.add_db(
        ContainerState::Running,
        &[
            ("stowd.hook.post", "notify-done"),
            ("stowd.action", "pause"),
            ("stowd.retry.hook.attempts", "1"),
        ],
    );
    h.sim.set_exit_code(DB, "notify-done", 2);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Failed));
    assert_eq!(job.error.as_ref().unwrap().phase, JobPhase::PostHook);
    assert!(job.archive.is_some());
    assert_eq!(h.sink.list("db").await.unwrap().len(), 1);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));

    // post hook runs after the container is back
    let calls = h.sim.calls();
    let unpause = calls
        .iter()
        .position(|c| c.operation == RuntimeOperation::Unpause)
        .unwrap();
    let exec = calls
        .iter()
        .position(|c| c.operation == RuntimeOperation::Exec)
        .unwrap();
    assert!(unpause < exec);
}

#[tokio::test]
async fn test_resume_failure_is_reported() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[("stowd.retry.resume.attempts", "2")]);
    h.sim.fail_always(RuntimeOperation::Unpause, DB);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Failed));
    assert!(job.resume_error.is_some());
    assert_eq!(job.error.as_ref().unwrap().phase, JobPhase::Resuming);
    assert!(job.archive.is_some());
    assert_eq!(h.count(RuntimeOperation::Unpause), 2);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Paused));
}

#[tokio::test]
async fn test_stop_action_restarts_container() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[("stowd.action", "stop")]);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
    assert_eq!(h.count(RuntimeOperation::Stop), 1);
    assert_eq!(h.count(RuntimeOperation::Start), 1);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));
}

#[tokio::test]
async fn test_paused_container_is_left_paused() {
    let h = Harness::new();
    h.add_db(ContainerState::Paused, &[]);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
    assert_eq!(h.count(RuntimeOperation::Pause), 0);
    assert_eq!(h.count(RuntimeOperation::Unpause), 0);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Paused));
}

#[tokio::test]
async fn test_paused_container_cannot_be_stopped() {
    let h = Harness::new();
    h.add_db(ContainerState::Paused, &[("stowd.action", "stop")]);
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Failed));
    assert_eq!(job.error.as_ref().unwrap().phase, JobPhase::Quiescing);
    assert_eq!(h.count(RuntimeOperation::Stop), 0);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Paused));
}

#[tokio::test]
async fn test_stopped_container_skips_hooks() {
    let h = Harness::new();
    h.add_db(
        ContainerState::Stopped,
        &[("stowd.hook.pre", "dump"), ("stowd.hook.post", "cleanup")],
    );
    let target = h.target("db").await;

    let job = h.run(&target).await;

    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
    assert_eq!(h.count(RuntimeOperation::Exec), 0);
    assert!(!job.visited(JobPhase::PreHook));
    assert!(!job.visited(JobPhase::PostHook));
    assert_eq!(h.sim.state(DB), Some(ContainerState::Stopped));
}
