//! In-memory view of active jobs.
//!
//! Jobs report every phase change and finished volume here so the RPC surface
//! can answer `jobs.active` without touching the database. Only finished jobs
//! are written to history.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::models::{Job, JobPhase};

/// Snapshot of one running job.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub job_id: String,
    pub target_id: String,
    pub container: String,
    pub phase: JobPhase,
    pub started_at: DateTime<Utc>,
    pub phase_since: DateTime<Utc>,
    pub volumes_total: usize,
    pub volumes_captured: usize,
    pub bytes_captured: u64,
}

/// Thread-safe store of active job snapshots, shared through `AppContext`.
#[derive(Clone, Default)]
pub struct JobTracker {
    inner: Arc<RwLock<HashMap<String, ActiveJob>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, job: &Job, volumes_total: usize) {
        let mut map = self.inner.write().await;
        map.insert(
            job.id.clone(),
            ActiveJob {
                job_id: job.id.clone(),
                target_id: job.target_id.clone(),
                container: job.container.name.clone(),
                phase: job.phase,
                started_at: job.started_at,
                phase_since: Utc::now(),
                volumes_total,
                volumes_captured: 0,
                bytes_captured: 0,
            },
        );
    }

    pub async fn set_phase(&self, job_id: &str, phase: JobPhase) {
        let mut map = self.inner.write().await;
        if let Some(active) = map.get_mut(job_id) {
            active.phase = phase;
            active.phase_since = Utc::now();
        }
    }

    pub async fn record_capture(&self, job_id: &str, bytes: u64) {
        let mut map = self.inner.write().await;
        if let Some(active) = map.get_mut(job_id) {
            active.volumes_captured += 1;
            active.bytes_captured += bytes;
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<ActiveJob> {
        let map = self.inner.read().await;
        map.get(job_id).cloned()
    }

    /// Remove a job from tracking (called when it reaches a terminal phase).
    pub async fn remove(&self, job_id: &str) {
        let mut map = self.inner.write().await;
        map.remove(job_id);
    }

    /// All active jobs, oldest first.
    pub async fn get_all(&self) -> Vec<ActiveJob> {
        let map = self.inner.read().await;
        let mut jobs: Vec<ActiveJob> = map.values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.job_id.cmp(&b.job_id)));
        jobs
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}
