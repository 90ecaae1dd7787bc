//! In-memory container runtime for simulation mode and tests.
//!
//! [`SimulatedRuntime`] implements [`ContainerRuntime`] over a shared table of
//! fake containers. The paired [`Simulator`] handle seeds that table, injects
//! faults and delays, and reads back the call log.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::models::{ContainerRef, ContainerState};
use crate::core::runtime::{ContainerInfo, ContainerRuntime, CopyStream, ExecCommand, ExecOutput};
use crate::error::{RuntimeError, RuntimeOperation};

/// One call made against the runtime, in order of arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    pub operation: RuntimeOperation,
    pub container: String,
    /// Copied path or executed command.
    pub detail: Option<String>,
}

struct SimContainer {
    reference: ContainerRef,
    labels: HashMap<String, String>,
    state: ContainerState,
    files: HashMap<String, Vec<u8>>,
    /// Extra bytes announced on top of the real length, per path.
    overstated: HashMap<String, u64>,
    exit_codes: HashMap<String, i64>,
}

struct Fault {
    operation: RuntimeOperation,
    container: Option<String>,
    path: Option<String>,
    /// `None` fails forever.
    remaining: Option<u32>,
}

struct Delay {
    operation: RuntimeOperation,
    container: Option<String>,
    duration: Duration,
    remaining: Option<u32>,
}

#[derive(Default)]
struct SimState {
    containers: BTreeMap<String, SimContainer>,
    faults: Vec<Fault>,
    delays: Vec<Delay>,
    calls: Vec<RuntimeCall>,
}

fn matches(filter: &Option<String>, value: &str) -> bool {
    filter.as_deref().is_none_or(|f| f == value)
}

fn consume(remaining: &mut Option<u32>) -> bool {
    match remaining {
        None => true,
        Some(0) => false,
        Some(n) => {
            *n -= 1;
            true
        }
    }
}

impl SimState {
    fn take_fault(&mut self, operation: RuntimeOperation, container: &str, path: Option<&str>) -> bool {
        self.faults.iter_mut().any(|f| {
            f.operation == operation
                && matches(&f.container, container)
                && (f.path.is_none() || f.path.as_deref() == path)
                && consume(&mut f.remaining)
        })
    }

    fn take_delay(&mut self, operation: RuntimeOperation, container: &str) -> Option<Duration> {
        self.delays.iter_mut().find_map(|d| {
            (d.operation == operation
                && matches(&d.container, container)
                && consume(&mut d.remaining))
                .then_some(d.duration)
        })
    }
}

pub struct SimulatedRuntime {
    state: Arc<Mutex<SimState>>,
}

/// Control handle for a [`SimulatedRuntime`].
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRuntime {
    pub fn new() -> (Self, Simulator) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: state.clone(),
            },
            Simulator { state },
        )
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log the call, apply any configured delay, then fail if a fault matches.
    async fn enter(
        &self,
        operation: RuntimeOperation,
        container: &str,
        detail: Option<&str>,
    ) -> Result<(), RuntimeError> {
        let (delay, fail) = {
            let mut state = self.lock();
            state.calls.push(RuntimeCall {
                operation,
                container: container.to_string(),
                detail: detail.map(str::to_string),
            });
            (
                state.take_delay(operation, container),
                state.take_fault(operation, container, detail),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(RuntimeError::new(container, operation, "injected fault"));
        }
        Ok(())
    }

    fn with_container<T>(
        &self,
        container: &ContainerRef,
        operation: RuntimeOperation,
        f: impl FnOnce(&mut SimContainer) -> Result<T, String>,
    ) -> Result<T, RuntimeError> {
        let mut state = self.lock();
        let entry = state.containers.get_mut(&container.id).ok_or_else(|| {
            RuntimeError::new(&container.name, operation, "no such container")
        })?;
        f(entry).map_err(|cause| RuntimeError::new(&container.name, operation, cause))
    }

    async fn change_state(
        &self,
        container: &ContainerRef,
        operation: RuntimeOperation,
    ) -> Result<(), RuntimeError> {
        self.enter(operation, &container.id, None).await?;
        self.with_container(container, operation, |c| {
            use ContainerState::*;
            use RuntimeOperation as Op;
            c.state = match (operation, c.state) {
                (Op::Pause, Running | Paused) => Paused,
                (Op::Unpause, Running | Paused) => Running,
                (Op::Stop, Running | Stopped) => Stopped,
                (Op::Start, Running | Stopped) => Running,
                (_, state) => {
                    return Err(format!("cannot {} a {} container", operation, state.as_str()));
                }
            };
            Ok(())
        })
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.enter(RuntimeOperation::Ping, "", None).await
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        self.enter(RuntimeOperation::List, "", Some(label)).await?;
        let (key, value) = match label.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (label, None),
        };

        let state = self.lock();
        Ok(state
            .containers
            .values()
            .filter(|c| match (c.labels.get(key), value) {
                (Some(actual), Some(wanted)) => actual == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .map(|c| ContainerInfo {
                reference: c.reference.clone(),
                labels: c.labels.clone(),
                state: c.state,
            })
            .collect())
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerState, RuntimeError> {
        self.enter(RuntimeOperation::Inspect, &container.id, None)
            .await?;
        self.with_container(container, RuntimeOperation::Inspect, |c| Ok(c.state))
    }

    async fn pause(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.change_state(container, RuntimeOperation::Pause).await
    }

    async fn unpause(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.change_state(container, RuntimeOperation::Unpause)
            .await
    }

    async fn stop(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.change_state(container, RuntimeOperation::Stop).await
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.change_state(container, RuntimeOperation::Start).await
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        command: &ExecCommand,
    ) -> Result<ExecOutput, RuntimeError> {
        self.enter(RuntimeOperation::Exec, &container.id, Some(&command.command))
            .await?;
        self.with_container(container, RuntimeOperation::Exec, |c| {
            if c.state != ContainerState::Running {
                return Err(format!("container is {}", c.state.as_str()));
            }
            let exit_code = c.exit_codes.get(&command.command).copied().unwrap_or(0);
            Ok(ExecOutput {
                exit_code,
                output: format!("simulated: {}", command.command),
            })
        })
    }

    async fn copy_out(
        &self,
        container: &ContainerRef,
        path: &str,
    ) -> Result<CopyStream, RuntimeError> {
        self.enter(RuntimeOperation::CopyOut, &container.id, Some(path))
            .await?;
        let (data, expected_len) = self.with_container(container, RuntimeOperation::CopyOut, |c| {
            let data = c
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| format!("no such path '{}'", path))?;
            let extra = c.overstated.get(path).copied().unwrap_or(0);
            let len = data.len() as u64 + extra;
            Ok((data, len))
        })?;

        Ok(CopyStream::complete(
            Box::pin(Cursor::new(data)),
            Some(expected_len),
        ))
    }
}

impl Simulator {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_container(
        &self,
        id: &str,
        name: &str,
        labels: &[(&str, &str)],
        state: ContainerState,
    ) -> ContainerRef {
        let reference = ContainerRef {
            id: id.to_string(),
            name: name.to_string(),
        };
        self.lock().containers.insert(
            id.to_string(),
            SimContainer {
                reference: reference.clone(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                state,
                files: HashMap::new(),
                overstated: HashMap::new(),
                exit_codes: HashMap::new(),
            },
        );
        reference
    }

    pub fn remove_container(&self, id: &str) -> bool {
        self.lock().containers.remove(id).is_some()
    }

    pub fn containers(&self) -> Vec<ContainerRef> {
        self.lock()
            .containers
            .values()
            .map(|c| c.reference.clone())
            .collect()
    }

    pub fn set_file(&self, id: &str, path: &str, data: impl Into<Vec<u8>>) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.files.insert(path.to_string(), data.into());
        }
    }

    pub fn set_label(&self, id: &str, key: &str, value: &str) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.labels.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.state = state;
        }
    }

    pub fn state(&self, id: &str) -> Option<ContainerState> {
        self.lock().containers.get(id).map(|c| c.state)
    }

    /// Make `exec` of exactly `command` exit with `code`.
    pub fn set_exit_code(&self, id: &str, command: &str, code: i64) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.exit_codes.insert(command.to_string(), code);
        }
    }

    /// Announce `extra` more bytes for `path` than the stream delivers.
    pub fn overstate_length(&self, id: &str, path: &str, extra: u64) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.overstated.insert(path.to_string(), extra);
        }
    }

    /// Fail the next `times` calls of `operation` on container `id`.
    pub fn fail(&self, operation: RuntimeOperation, id: &str, times: u32) {
        self.push_fault(operation, Some(id), None, Some(times));
    }

    pub fn fail_always(&self, operation: RuntimeOperation, id: &str) {
        self.push_fault(operation, Some(id), None, None);
    }

    /// Fail every call of `operation`, whatever the container.
    pub fn fail_everywhere(&self, operation: RuntimeOperation) {
        self.push_fault(operation, None, None, None);
    }

    /// Fail the next `times` copies of `path` out of container `id`.
    pub fn fail_copy(&self, id: &str, path: &str, times: u32) {
        self.push_fault(RuntimeOperation::CopyOut, Some(id), Some(path), Some(times));
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.delays.clear();
    }

    /// Hold the next `times` calls of `operation` on `id` for `duration`
    /// (every call when `times` is `None`).
    pub fn delay(&self, operation: RuntimeOperation, id: &str, duration: Duration, times: Option<u32>) {
        self.lock().delays.push(Delay {
            operation,
            container: Some(id.to_string()),
            duration,
            remaining: times,
        });
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, operation: RuntimeOperation, id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation && c.container == id)
            .count()
    }

    fn push_fault(
        &self,
        operation: RuntimeOperation,
        container: Option<&str>,
        path: Option<&str>,
        remaining: Option<u32>,
    ) {
        self.lock().faults.push(Fault {
            operation,
            container: container.map(str::to_string),
            path: path.map(str::to_string),
            remaining,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn state_changes_are_idempotent() {
        let (runtime, sim) = SimulatedRuntime::new();
        let db = sim.add_container("c1", "db", &[], ContainerState::Running);

        runtime.pause(&db).await.unwrap();
        runtime.pause(&db).await.unwrap();
        assert_eq!(sim.state("c1"), Some(ContainerState::Paused));

        runtime.unpause(&db).await.unwrap();
        runtime.unpause(&db).await.unwrap();
        assert_eq!(sim.state("c1"), Some(ContainerState::Running));

        runtime.stop(&db).await.unwrap();
        assert!(runtime.pause(&db).await.is_err());
        runtime.start(&db).await.unwrap();
        assert_eq!(sim.state("c1"), Some(ContainerState::Running));
    }

    #[tokio::test]
    async fn faults_are_consumed() {
        let (runtime, sim) = SimulatedRuntime::new();
        let db = sim.add_container("c1", "db", &[], ContainerState::Running);
        sim.set_file("c1", "/data", b"payload".to_vec());
        sim.fail_copy("c1", "/data", 1);

        assert!(runtime.copy_out(&db, "/data").await.is_err());
        let mut stream = runtime.copy_out(&db, "/data").await.unwrap();
        let mut buf = Vec::new();
        stream.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload");
        assert_eq!(stream.expected_len, Some(7));
        assert_eq!(sim.count(RuntimeOperation::CopyOut, "c1"), 2);
    }

    #[tokio::test]
    async fn list_filters_on_label_value() {
        let (runtime, sim) = SimulatedRuntime::new();
        sim.add_container("c1", "db", &[("stowd.enable", "true")], ContainerState::Running);
        sim.add_container("c2", "web", &[("stowd.enable", "false")], ContainerState::Running);
        sim.add_container("c3", "cache", &[], ContainerState::Running);

        assert_eq!(runtime.list_containers("stowd.enable").await.unwrap().len(), 2);
        let enabled = runtime.list_containers("stowd.enable=true").await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].reference.name, "db");
    }

    #[tokio::test]
    async fn exec_requires_running_container() {
        let (runtime, sim) = SimulatedRuntime::new();
        let db = sim.add_container("c1", "db", &[], ContainerState::Paused);
        sim.set_exit_code("c1", "flush", 3);
        let command = ExecCommand {
            command: "flush".into(),
            user: None,
        };

        assert!(runtime.exec(&db, &command).await.is_err());
        sim.set_state("c1", ContainerState::Running);
        assert_eq!(runtime.exec(&db, &command).await.unwrap().exit_code, 3);
    }
}
