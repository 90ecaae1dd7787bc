//! Container runtime backed by the Docker Engine API through `bollard`.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    DownloadFromContainerOptions, InspectContainerOptions, ListContainersOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerState as EngineState, ContainerSummary};
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::core::models::{ContainerRef, ContainerState};
use crate::core::runtime::{ContainerInfo, ContainerRuntime, CopyStream, ExecCommand, ExecOutput};
use crate::error::{RuntimeError, RuntimeOperation};

/// Seconds the engine waits for a graceful stop before killing.
const STOP_GRACE_SECS: i64 = 10;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    ///
    /// No request is made; use [`ContainerRuntime::ping`] to check the engine.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| api_error("", RuntimeOperation::Ping, e))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Move `container` to `wanted` unless it is already there.
    ///
    /// `from` is the only state the request applies to.
    async fn transition(
        &self,
        container: &ContainerRef,
        operation: RuntimeOperation,
        from: ContainerState,
        wanted: ContainerState,
    ) -> Result<(), RuntimeError> {
        let current = self.inspect(container).await?;
        if current == wanted {
            debug!(container = %container, operation = %operation, "Already in requested state");
            return Ok(());
        }
        if current != from {
            return Err(RuntimeError::new(
                &container.name,
                operation,
                format!("container is {}", current.as_str()),
            ));
        }

        let id = container.id.as_str();
        let result = match operation {
            RuntimeOperation::Pause => self.docker.pause_container(id).await,
            RuntimeOperation::Unpause => self.docker.unpause_container(id).await,
            RuntimeOperation::Stop => {
                self.docker
                    .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                    .await
            }
            RuntimeOperation::Start => {
                self.docker
                    .start_container(id, None::<StartContainerOptions<String>>)
                    .await
            }
            other => {
                return Err(RuntimeError::new(
                    &container.name,
                    other,
                    "not a state transition",
                ));
            }
        };
        result.map_err(|e| api_error(&container.name, operation, e))
    }
}

fn api_error(container: &str, operation: RuntimeOperation, e: bollard::errors::Error) -> RuntimeError {
    RuntimeError::new(container, operation, e.to_string())
}

/// State as reported by `GET /containers/{id}/json`.
fn state_from_engine(state: &EngineState) -> ContainerState {
    if state.paused.unwrap_or(false) {
        ContainerState::Paused
    } else if state.running.unwrap_or(false) {
        ContainerState::Running
    } else {
        ContainerState::Stopped
    }
}

/// State from the `State` column of a container listing.
fn state_from_status(status: &str) -> ContainerState {
    match status {
        "running" => ContainerState::Running,
        "paused" => ContainerState::Paused,
        _ => ContainerState::Stopped,
    }
}

/// Listing entries without an id are skipped.
fn container_info(summary: ContainerSummary) -> Option<ContainerInfo> {
    let id = summary.id?;
    let name = summary
        .names
        .unwrap_or_default()
        .into_iter()
        .next()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    Some(ContainerInfo {
        reference: ContainerRef { id, name },
        labels: summary.labels.unwrap_or_default(),
        state: state_from_status(summary.state.as_deref().unwrap_or_default()),
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| api_error("", RuntimeOperation::Ping, e))?;
        debug!(version = version.version.as_deref().unwrap_or("unknown"), "Docker engine reachable");
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let filters = HashMap::from([("label".to_string(), vec![label.to_string()])]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| api_error("", RuntimeOperation::List, e))?;

        Ok(summaries.into_iter().filter_map(container_info).collect())
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerState, RuntimeError> {
        let details = self
            .docker
            .inspect_container(&container.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| api_error(&container.name, RuntimeOperation::Inspect, e))?;
        let state = details.state.ok_or_else(|| {
            RuntimeError::new(&container.name, RuntimeOperation::Inspect, "engine reported no state")
        })?;
        Ok(state_from_engine(&state))
    }

    async fn pause(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.transition(
            container,
            RuntimeOperation::Pause,
            ContainerState::Running,
            ContainerState::Paused,
        )
        .await
    }

    async fn unpause(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.transition(
            container,
            RuntimeOperation::Unpause,
            ContainerState::Paused,
            ContainerState::Running,
        )
        .await
    }

    async fn stop(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.transition(
            container,
            RuntimeOperation::Stop,
            ContainerState::Running,
            ContainerState::Stopped,
        )
        .await
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.transition(
            container,
            RuntimeOperation::Start,
            ContainerState::Stopped,
            ContainerState::Running,
        )
        .await
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        command: &ExecCommand,
    ) -> Result<ExecOutput, RuntimeError> {
        let failed = |e: bollard::errors::Error| api_error(&container.name, RuntimeOperation::Exec, e);

        let options = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.command.clone()]),
            user: command.user.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(&container.id, options)
            .await
            .map_err(failed)?;

        let mut text = String::new();
        match self.docker.start_exec(&created.id, None).await.map_err(failed)? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk.map_err(failed)?;
                    text.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::new(
                    &container.name,
                    RuntimeOperation::Exec,
                    "exec started detached",
                ));
            }
        }

        let inspected = self.docker.inspect_exec(&created.id).await.map_err(failed)?;
        Ok(ExecOutput {
            // killed by a signal
            exit_code: inspected.exit_code.unwrap_or(-1),
            output: text,
        })
    }

    async fn copy_out(
        &self,
        container: &ContainerRef,
        path: &str,
    ) -> Result<CopyStream, RuntimeError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        // engine errors, including a missing path, surface as read errors
        let body = self
            .docker
            .download_from_container(&container.id, Some(options))
            .map_err(io::Error::other);

        Ok(CopyStream::complete(Box::pin(StreamReader::new(body)), None))
    }
}
