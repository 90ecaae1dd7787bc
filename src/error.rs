//! Error taxonomy for the backup core.
//!
//! Domain errors are typed so the job state machine can decide what is
//! retryable. Application edges (CLI, database, RPC server) wrap these in
//! `anyhow` like the rest of the daemon.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::models::JobPhase;

/// A target's labels could not be turned into a usable configuration.
///
/// Scoped to a single target: discovery logs it and carries on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required label '{0}'")]
    MissingLabel(String),

    #[error("invalid value '{value}' for label '{label}': {reason}")]
    InvalidLabel {
        label: String,
        value: String,
        reason: String,
    },

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("target '{0}' is already defined by another container")]
    DuplicateTarget(String),
}

impl ConfigError {
    pub fn invalid(label: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidLabel {
            label: label.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Container runtime operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOperation {
    Ping,
    List,
    Inspect,
    Pause,
    Unpause,
    Stop,
    Start,
    Exec,
    CopyOut,
}

impl RuntimeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::List => "list",
            Self::Inspect => "inspect",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Exec => "exec",
            Self::CopyOut => "copy_out",
        }
    }
}

impl fmt::Display for RuntimeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by the container runtime adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed on container '{container}': {cause}")]
pub struct RuntimeError {
    pub container: String,
    pub operation: RuntimeOperation,
    pub cause: String,
}

impl RuntimeError {
    pub fn new(
        container: impl Into<String>,
        operation: RuntimeOperation,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            container: container.into(),
            operation,
            cause: cause.into(),
        }
    }
}

/// Failure while building an archive or talking to the storage sink.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("archive '{0}' already exists, refusing to overwrite")]
    AlreadyExists(String),

    #[error("storage sink error: {0}")]
    Sink(String),

    #[error("archive task failed: {0}")]
    Task(String),
}

/// Everything that can end a job phase unsuccessfully.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("integrity check failed for volume '{volume}': {detail}")]
    CaptureIntegrity { volume: String, detail: String },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("hook '{command}' exited with rejected code {exit_code}")]
    HookRejected { command: String, exit_code: i64 },

    #[error("{phase} timed out after {}s", after.as_secs())]
    Timeout { phase: JobPhase, after: Duration },

    #[error("aborted during {phase}: daemon is shutting down")]
    Aborted { phase: JobPhase },

    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: JobPhase, to: JobPhase },
}

impl BackupError {
    /// Whether another attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::Runtime(_) | BackupError::Timeout { .. } | BackupError::HookRejected { .. }
        )
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, BackupError::Aborted { .. })
    }

    /// Short machine-readable classification stored in job history.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "config",
            BackupError::Runtime(_) => "runtime",
            BackupError::CaptureIntegrity { .. } => "capture_integrity",
            BackupError::Archive(_) => "archive",
            BackupError::HookRejected { .. } => "hook_rejected",
            BackupError::Timeout { .. } => "timeout",
            BackupError::Aborted { .. } => "aborted",
            BackupError::IllegalTransition { .. } => "internal",
        }
    }
}
