//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls to the appropriate handler functions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::models::BackupTarget;
use crate::core::progress::ActiveJob;
use crate::core::Orchestrator;
use crate::db;

use super::protocol::{Request, Response};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 1_000;

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    orchestrator: Arc<Orchestrator>,
}

#[derive(Serialize)]
struct DaemonStatus {
    version: &'static str,
    started_at: DateTime<Utc>,
    uptime_secs: i64,
    targets: usize,
    running_jobs: usize,
    active_jobs: usize,
    shutting_down: bool,
    rpc_bind: String,
    simulation: bool,
}

#[derive(Serialize)]
struct TargetSummary {
    #[serde(flatten)]
    target: BackupTarget,
    running_job: Option<String>,
}

#[derive(Serialize)]
struct ActiveJobs {
    jobs: Vec<ActiveJob>,
    count: usize,
}

impl MethodHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await,
            "jobs.list" => self.jobs_list(id, &request).await,
            "jobs.get" => self.jobs_get(id, &request).await,
            "jobs.active" => self.jobs_active(id).await,
            "jobs.trigger" => self.jobs_trigger(id, &request),
            "targets.list" => self.targets_list(id),
            "scheduler.upcoming" => Response::success(id, self.orchestrator.upcoming()),
            _ => Response::method_not_found(id, &request.method),
        }
    }

    async fn daemon_status(&self, id: Value) -> Response {
        let ctx = self.orchestrator.context();
        let coordinator = self.orchestrator.coordinator();
        let started_at = self.orchestrator.started_at();

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                started_at,
                uptime_secs: (Utc::now() - started_at).num_seconds(),
                targets: self.orchestrator.registry().all().len(),
                running_jobs: coordinator.running_count(),
                active_jobs: ctx.tracker.active_count().await,
                shutting_down: coordinator.is_shutting_down(),
                rpc_bind: ctx.config.rpc_bind.to_string(),
                simulation: ctx.config.simulation,
            },
        )
    }

    /// Most recent jobs first, optionally for one target.
    async fn jobs_list(&self, id: Value, request: &Request) -> Response {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            target_id: Option<String>,
            #[serde(default)]
            limit: Option<usize>,
        }

        let params: Params = match request.params_or_default() {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e),
        };
        let limit = params
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);

        match db::jobs::list(&self.orchestrator.context().db, params.target_id, limit).await {
            Ok(jobs) => Response::success(id, jobs),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    /// Get a single job with its full status history.
    async fn jobs_get(&self, id: Value, request: &Request) -> Response {
        #[derive(Deserialize)]
        struct Params {
            id: String,
        }

        let params: Params = match request.params() {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e),
        };

        match db::jobs::get_with_history(&self.orchestrator.context().db, params.id.clone()).await {
            Ok(Some(job)) => Response::success(id, job),
            Ok(None) => Response::job_not_found(id, &params.id),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    async fn jobs_active(&self, id: Value) -> Response {
        let jobs = self.orchestrator.context().tracker.get_all().await;
        let count = jobs.len();
        Response::success(id, ActiveJobs { jobs, count })
    }

    fn jobs_trigger(&self, id: Value, request: &Request) -> Response {
        #[derive(Deserialize)]
        struct Params {
            target_id: String,
        }

        let params: Params = match request.params() {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e),
        };

        match self.orchestrator.trigger(&params.target_id) {
            Some(admission) => Response::success(id, admission),
            None => Response::unknown_target(id, &params.target_id),
        }
    }

    fn targets_list(&self, id: Value) -> Response {
        let locks = self.orchestrator.coordinator().locks();
        let targets: Vec<TargetSummary> = self
            .orchestrator
            .registry()
            .all()
            .into_iter()
            .map(|target| TargetSummary {
                running_job: locks.holder(&target.id),
                target: BackupTarget::clone(&target),
            })
            .collect();
        Response::success(id, targets)
    }
}
