use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::core::models::{ContainerRef, ContainerState};
use crate::error::RuntimeError;

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub reference: ContainerRef,
    pub labels: HashMap<String, String>,
    pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand {
    pub command: String,
    pub user: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Resolves once the runtime has finished producing a copy stream.
pub type CopyCompletion = Pin<Box<dyn Future<Output = Result<(), RuntimeError>> + Send>>;

/// Byte stream of a path copied out of a container.
///
/// `reader` must be drained to EOF before awaiting `completion`, which reports
/// whether the runtime considers the stream complete.
pub struct CopyStream {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    /// Length announced by the runtime, if it knows it up front.
    pub expected_len: Option<u64>,
    pub completion: CopyCompletion,
}

impl CopyStream {
    pub fn complete(
        reader: Pin<Box<dyn AsyncRead + Send>>,
        expected_len: Option<u64>,
    ) -> Self {
        Self {
            reader,
            expected_len,
            completion: Box::pin(async { Ok(()) }),
        }
    }
}

/// Capability surface over the container runtime.
///
/// `pause`, `unpause`, `stop` and `start` are idempotent: asking for the state
/// a container is already in is a no-op, not an error.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check the runtime is reachable.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// List containers carrying `label` (either `key` or `key=value`).
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>, RuntimeError>;

    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerState, RuntimeError>;

    async fn pause(&self, container: &ContainerRef) -> Result<(), RuntimeError>;

    async fn unpause(&self, container: &ContainerRef) -> Result<(), RuntimeError>;

    async fn stop(&self, container: &ContainerRef) -> Result<(), RuntimeError>;

    async fn start(&self, container: &ContainerRef) -> Result<(), RuntimeError>;

    async fn exec(
        &self,
        container: &ContainerRef,
        command: &ExecCommand,
    ) -> Result<ExecOutput, RuntimeError>;

    async fn copy_out(&self, container: &ContainerRef, path: &str)
    -> Result<CopyStream, RuntimeError>;
}
