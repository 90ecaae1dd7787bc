mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{DB, Harness};
use stowd::config::AppConfig;
use stowd::context::AppContext;
use stowd::core::Orchestrator;
use stowd::core::coordinator::{Admission, JobCoordinator, RejectReason, TriggerSource};
use stowd::core::models::{ContainerState, JobOutcome, JobPhase};
use stowd::db;
use stowd::error::RuntimeOperation;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

async fn wait_for_phase(h: &Harness, phase: JobPhase) {
    timeout(Duration::from_secs(5), async {
        loop {
            if h.tracker.get_all().await.iter().any(|j| j.phase == phase) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job never reached phase");
}

#[tokio::test]
async fn test_double_trigger_admits_one() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    h.sim
        .delay(RuntimeOperation::CopyOut, DB, Duration::from_millis(200), Some(1));
    let target = h.target("db").await;
    let coordinator = h.coordinator(4);
    let mut finished = coordinator.subscribe();

    let first = coordinator.on_trigger(target.clone(), TriggerSource::Schedule);
    let second = coordinator.on_trigger(target.clone(), TriggerSource::Manual);

    let job_id = first.job_id().expect("first trigger admitted").to_string();
    assert_eq!(
        second,
        Admission::Rejected {
            reason: RejectReason::AlreadyRunning {
                job_id: job_id.clone()
            }
        }
    );

    let job = timeout(Duration::from_secs(5), finished.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, job_id);
    assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
    assert_eq!(coordinator.running_count(), 0);
    assert_eq!(h.count(RuntimeOperation::Pause), 1);
}

#[tokio::test]
async fn test_different_targets_run_under_one_slot() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    h.add_container("c-web", "web", ContainerState::Running, &[]);
    h.registry.refresh().await.unwrap();
    let coordinator = h.coordinator(1);
    let mut finished = coordinator.subscribe();

    for id in ["db", "web"] {
        let target = h.registry.get(id).unwrap();
        assert!(matches!(
            coordinator.on_trigger(target, TriggerSource::Manual),
            Admission::Admitted { .. }
        ));
    }

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let job = timeout(Duration::from_secs(5), finished.recv())
            .await
            .unwrap()
            .unwrap();
        outcomes.push((job.target_id, job.outcome));
    }
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        outcomes,
        vec![
            ("db".to_string(), Some(JobOutcome::Succeeded)),
            ("web".to_string(), Some(JobOutcome::Succeeded)),
        ]
    );
}

#[tokio::test]
async fn test_shutdown_aborts_running_job() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    h.sim
        .delay(RuntimeOperation::CopyOut, DB, Duration::from_secs(30), None);
    let target = h.target("db").await;
    let coordinator = h.coordinator(2);
    let mut finished = coordinator.subscribe();

    coordinator.on_trigger(target.clone(), TriggerSource::Manual);
    wait_for_phase(&h, JobPhase::Capturing).await;

    let report = coordinator.shutdown(Duration::from_secs(5)).await;
    assert!(report.clean);
    assert_eq!(report.forced_resumes, 0);

    let job = finished.recv().await.unwrap();
    assert_eq!(job.outcome, Some(JobOutcome::Aborted));
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));

    assert_eq!(
        coordinator.on_trigger(target, TriggerSource::Manual),
        Admission::Rejected {
            reason: RejectReason::ShuttingDown
        }
    );
}

#[tokio::test]
async fn test_shutdown_forces_resume_of_stuck_job() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    h.sim
        .delay(RuntimeOperation::CopyOut, DB, Duration::from_secs(30), None);
    // the job's own unpause hangs; the forced one goes through
    h.sim
        .delay(RuntimeOperation::Unpause, DB, Duration::from_secs(30), Some(1));
    let target = h.target("db").await;
    let coordinator = h.coordinator(2);

    coordinator.on_trigger(target, TriggerSource::Manual);
    wait_for_phase(&h, JobPhase::Capturing).await;

    let report = coordinator.shutdown(Duration::from_millis(200)).await;
    assert!(!report.clean);
    assert_eq!(report.forced_resumes, 1);
    assert_eq!(report.forced_resume_failures, 0);
    assert_eq!(h.sim.state(DB), Some(ContainerState::Running));
}

#[tokio::test]
async fn test_job_history_is_recorded() {
    let h = Harness::new();
    h.add_db(ContainerState::Running, &[]);
    let target = h.target("db").await;
    let conn = db::open_in_memory().await.unwrap();
    let coordinator = JobCoordinator::new(h.runner.clone(), 1, Some(conn.clone()), None);
    let mut finished = coordinator.subscribe();

    let admission = coordinator.on_trigger(target, TriggerSource::Schedule);
    let job = timeout(Duration::from_secs(5), finished.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Some(job.id.as_str()), admission.job_id());

    let jobs = db::jobs::list(&conn, Some("db".into()), 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].trigger, "schedule");
    assert_eq!(jobs[0].phase, "Succeeded");
    assert!(jobs[0].archive_name.is_some());

    let detail = db::jobs::get_with_history(&conn, job.id.clone())
        .await
        .unwrap()
        .unwrap();
    let phases: Vec<&str> = detail.history.iter().map(|e| e.status.as_str()).collect();
    assert_eq!(phases.first().copied(), Some("Pending"));
    assert_eq!(phases.last().copied(), Some("Succeeded"));
}

#[tokio::test]
async fn test_hung_discovery_does_not_stall_schedules() {
    let h = Harness::new();
    h.add_db(
        ContainerState::Running,
        &[("stowd.schedule", "* * * * * *"), ("stowd.action", "ignore")],
    );
    let config = AppConfig {
        archive_directory: h.dir.path().join("archives"),
        staging_directory: Some(h.dir.path().join("staging")),
        discovery_interval_secs: 1,
        discovery_timeout_secs: 60,
        shutdown_timeout_secs: 5,
        defaults: common::fast_defaults(),
        ..AppConfig::default()
    };
    let ctx = AppContext::new(config, db::open_in_memory().await.unwrap());
    let orchestrator = Arc::new(Orchestrator::new(ctx, h.runtime.clone(), h.sink.clone()));
    let mut finished = orchestrator.coordinator().subscribe();

    let shutdown = CancellationToken::new();
    let daemon = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        async move { orchestrator.start(shutdown).await }
    });

    // the first scheduled job shows discovery and scheduling are up
    let first = timeout(Duration::from_secs(5), finished.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.outcome, Some(JobOutcome::Succeeded));

    // from here on every container listing hangs
    h.sim
        .delay(RuntimeOperation::List, "", Duration::from_secs(60), None);
    let listings_before = h.sim.count(RuntimeOperation::List, "");

    let window = Instant::now() + Duration::from_secs(4);
    let mut during_hang = 0;
    while let Ok(Ok(job)) = timeout_at(window, finished.recv()).await {
        assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
        during_hang += 1;
    }
    assert!(
        during_hang >= 2,
        "only {} jobs finished while discovery hung",
        during_hang
    );
    assert!(h.sim.count(RuntimeOperation::List, "") > listings_before);

    shutdown.cancel();
    timeout(Duration::from_secs(3), daemon)
        .await
        .expect("shutdown waited on a hung discovery pass")
        .unwrap()
        .unwrap();
}
