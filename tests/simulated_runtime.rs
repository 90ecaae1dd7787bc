use std::sync::Arc;

use chrono::{TimeZone, Utc};
use stowd::adapters::SimulatedRuntime;
use stowd::config::TargetDefaults;
use stowd::core::models::{ContainerState, QuiesceAction};
use stowd::core::runtime::ContainerRuntime;
use stowd::core::{Scheduler, TargetRegistry};
use stowd::error::RuntimeOperation;

fn registry() -> (TargetRegistry, stowd::adapters::Simulator) {
    let (runtime, sim) = SimulatedRuntime::new();
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
    (
        TargetRegistry::new(runtime, "stowd", TargetDefaults::default()),
        sim,
    )
}

#[tokio::test]
async fn test_discovery_reads_labels() {
    let (registry, sim) = registry();
    sim.add_container(
        "c1",
        "postgres",
        &[
            ("stowd.enable", "true"),
            ("stowd.schedule", "*/5 * * * *"),
            ("stowd.volumes", "data:/var/lib/postgresql/data"),
            ("stowd.hook.pre", "pg_dumpall -f /backup/dump.sql"),
        ],
        ContainerState::Running,
    );
    sim.add_container(
        "c2",
        "redis",
        &[
            ("stowd.enable", "true"),
            ("stowd.id", "cache"),
            ("stowd.schedule", "0 3 * * *"),
            ("stowd.volumes", "/data"),
            ("stowd.action", "stop"),
        ],
        ContainerState::Running,
    );

    let (report, changes) = registry.refresh().await.unwrap();
    assert_eq!(report.targets.len(), 2);
    assert!(report.rejected.is_empty());
    assert_eq!(changes.added, vec!["cache".to_string(), "postgres".to_string()]);

    let postgres = registry.get("postgres").unwrap();
    assert_eq!(postgres.quiesce, QuiesceAction::Ignore);
    assert!(postgres.pre_hook.is_some());

    let cache = registry.get("cache").unwrap();
    assert_eq!(cache.container.name, "redis");
    assert_eq!(cache.quiesce, QuiesceAction::Stop);
    assert_eq!(cache.volumes[0].name, "data");
}

#[tokio::test]
async fn test_bad_labels_reject_only_that_container() {
    let (registry, sim) = registry();
    sim.add_container(
        "c1",
        "good",
        &[
            ("stowd.enable", "true"),
            ("stowd.schedule", "0 0 * * *"),
            ("stowd.volumes", "/srv"),
        ],
        ContainerState::Running,
    );
    sim.add_container(
        "c2",
        "no-volumes",
        &[("stowd.enable", "true"), ("stowd.schedule", "0 0 * * *")],
        ContainerState::Running,
    );
    sim.add_container(
        "c3",
        "disabled",
        &[("stowd.enable", "false")],
        ContainerState::Running,
    );

    let (report, _) = registry.refresh().await.unwrap();
    assert_eq!(report.targets.len(), 1);
    assert_eq!(report.targets[0].id, "good");
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].container, "no-volumes");
}

#[tokio::test]
async fn test_removed_container_leaves_registry() {
    let (registry, sim) = registry();
    sim.add_container(
        "c1",
        "web",
        &[
            ("stowd.enable", "true"),
            ("stowd.schedule", "0 * * * *"),
            ("stowd.volumes", "/www"),
        ],
        ContainerState::Running,
    );
    registry.refresh().await.unwrap();
    assert!(registry.get("web").is_some());

    sim.remove_container("c1");
    let (_, changes) = registry.refresh().await.unwrap();
    assert_eq!(changes.removed, vec!["web".to_string()]);
    assert!(registry.get("web").is_none());
}

#[tokio::test]
async fn test_failed_discovery_is_an_error() {
    let (registry, sim) = registry();
    sim.fail_everywhere(RuntimeOperation::List);
    assert!(registry.refresh().await.is_err());
}

#[tokio::test]
async fn test_invalid_schedule_does_not_affect_others() {
    let (registry, sim) = registry();
    for (id, name, schedule) in [("c1", "a", "*/5 * * * *"), ("c2", "b", "not a cron")] {
        sim.add_container(
            id,
            name,
            &[
                ("stowd.enable", "true"),
                ("stowd.schedule", schedule),
                ("stowd.volumes", "/data"),
            ],
            ContainerState::Running,
        );
    }
    let (report, _) = registry.refresh().await.unwrap();
    assert_eq!(report.targets.len(), 2);

    let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 1, 0).unwrap();
    let mut scheduler = Scheduler::new();
    let rejected = scheduler.sync(&registry.all(), now);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].0, "b");

    let fires = scheduler.next_events(Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap());
    assert_eq!(fires.len(), 1);
    assert_eq!(fires[0].target_id, "a");
}
