use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BackupError, ConfigError};

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Paused,
    Stopped,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

/// What to do with a container so its volumes stop changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuiesceAction {
    Pause,
    Stop,
    /// Leave the container alone (hooks are expected to make data consistent).
    Ignore,
}

impl QuiesceAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pause" => Some(Self::Pause),
            "stop" => Some(Self::Stop),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

/// A volume or mount path inside the container to capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub path: String,
}

/// Decides whether a hook's exit code lets the backup continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCodeBehaviour {
    Ignore,
    FailIfNonZero,
    Accept(Vec<RangeInclusive<i64>>),
}

static EXIT_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<start>-?\d+)-(?P<end>-?\d+)|(?P<single>-?\d+))$")
        .expect("exit code range pattern is valid")
});

impl ExitCodeBehaviour {
    /// Parses `ignore`, `fail`, or a comma separated list of codes and ranges
    /// such as `0,2-5,-1`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        match value.as_str() {
            "ignore" => return Ok(Self::Ignore),
            "fail" => return Ok(Self::FailIfNonZero),
            "" => return Err("empty exit code list".to_string()),
            _ => {}
        }

        let mut ranges = Vec::new();
        for part in value.split(',') {
            let caps = EXIT_RANGE
                .captures(part)
                .ok_or_else(|| format!("invalid exit code range '{}'", part))?;

            let parse = |s: &str| {
                s.parse::<i64>()
                    .map_err(|e| format!("invalid exit code '{}': {}", s, e))
            };

            if let Some(single) = caps.name("single") {
                let code = parse(single.as_str())?;
                ranges.push(code..=code);
            } else {
                let mut start = parse(&caps["start"])?;
                let mut end = parse(&caps["end"])?;
                if start > end {
                    std::mem::swap(&mut start, &mut end);
                }
                ranges.push(start..=end);
            }
        }

        Ok(Self::Accept(ranges))
    }

    pub fn accepts(&self, exit_code: i64) -> bool {
        match self {
            Self::Ignore => true,
            Self::FailIfNonZero => exit_code == 0,
            Self::Accept(ranges) => ranges.iter().any(|r| r.contains(&exit_code)),
        }
    }
}

/// A command executed inside the target container around the backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookCommand {
    pub command: String,
    pub user: Option<String>,
    pub exit_codes: ExitCodeBehaviour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Retry budgets are independent per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicies {
    pub hook: RetryPolicy,
    pub capture: RetryPolicy,
    pub resume: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    pub hook: Duration,
    pub quiesce: Duration,
    /// Applies to each volume separately.
    pub capture: Duration,
    pub archive: Duration,
    pub resume: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_last: usize,
    pub max_age_days: Option<u32>,
}

/// A container configured for scheduled backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTarget {
    pub id: String,
    pub container: ContainerRef,
    pub schedule: String,
    pub volumes: Vec<VolumeSpec>,
    pub pre_hook: Option<HookCommand>,
    pub post_hook: Option<HookCommand>,
    pub quiesce: QuiesceAction,
    pub retry: RetryPolicies,
    pub timeouts: PhaseTimeouts,
    pub retention: RetentionPolicy,
}

/// Phases of a single backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobPhase {
    Pending,
    PreHook,
    Quiescing,
    Capturing,
    Archiving,
    Resuming,
    PostHook,
    Failing,
    Succeeded,
    Failed,
    Aborted,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::PreHook => "PreHook",
            Self::Quiescing => "Quiescing",
            Self::Capturing => "Capturing",
            Self::Archiving => "Archiving",
            Self::Resuming => "Resuming",
            Self::PostHook => "PostHook",
            Self::Failing => "Failing",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// The job's transition table. Every forward phase before resume can only
    /// leave through `Failing`, and `Failing` only leads to `Resuming`.
    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        match self {
            Pending => matches!(next, PreHook | Quiescing | Failing),
            PreHook => matches!(next, Quiescing | Failing),
            Quiescing => matches!(next, Capturing | Failing),
            Capturing => matches!(next, Archiving | Failing),
            Archiving => matches!(next, Resuming | Failing),
            Failing => matches!(next, Resuming),
            Resuming => matches!(next, PostHook | Succeeded | Failed | Aborted),
            PostHook => matches!(next, Succeeded | Failed | Aborted),
            Succeeded | Failed | Aborted => false,
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Aborted,
}

impl JobOutcome {
    pub fn phase(&self) -> JobPhase {
        match self {
            Self::Succeeded => JobPhase::Succeeded,
            Self::Failed => JobPhase::Failed,
            Self::Aborted => JobPhase::Aborted,
        }
    }
}

/// Per-volume capture outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    pub volume: VolumeSpec,
    pub bytes: u64,
    /// BLAKE3 of the captured stream, hex encoded.
    pub checksum: String,
    pub succeeded: bool,
    #[serde(skip)]
    pub spool: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub path: String,
    /// Entry name inside the archive.
    pub entry: String,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub archive: String,
    pub target_id: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub volumes: Vec<ManifestEntry>,
    pub total_size: u64,
}

/// Opaque handle returned by the storage sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation(pub String);

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub name: String,
    pub manifest: Manifest,
    pub total_size: u64,
    pub location: StorageLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub phase: JobPhase,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseChange {
    pub phase: JobPhase,
    pub at: DateTime<Utc>,
}

/// One backup attempt for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub target_id: String,
    pub container: ContainerRef,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: JobPhase,
    pub attempts: u32,
    pub captures: Vec<CaptureResult>,
    pub archive: Option<Archive>,
    pub outcome: Option<JobOutcome>,
    pub error: Option<JobFailure>,
    pub resume_error: Option<String>,
    pub transitions: Vec<PhaseChange>,
}

impl Job {
    pub fn new(target: &BackupTarget) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            target_id: target.id.clone(),
            container: target.container.clone(),
            started_at: now,
            finished_at: None,
            phase: JobPhase::Pending,
            attempts: 0,
            captures: Vec::new(),
            archive: None,
            outcome: None,
            error: None,
            resume_error: None,
            transitions: vec![PhaseChange {
                phase: JobPhase::Pending,
                at: now,
            }],
        }
    }

    /// Move to `next`, enforcing the transition table.
    pub fn transition(&mut self, next: JobPhase) -> Result<(), BackupError> {
        if !self.phase.can_transition_to(next) {
            return Err(BackupError::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }

        info!(
            target_id = %self.target_id,
            job_id = %self.id,
            from = %self.phase,
            phase = %next,
            "Phase transition"
        );

        self.phase = next;
        let at = Utc::now();
        self.transitions.push(PhaseChange { phase: next, at });

        if next.is_terminal() {
            self.finished_at = Some(at);
            self.outcome = Some(match next {
                JobPhase::Succeeded => JobOutcome::Succeeded,
                JobPhase::Aborted => JobOutcome::Aborted,
                _ => JobOutcome::Failed,
            });
        }
        Ok(())
    }

    /// Record the first error of the job; later errors do not overwrite it.
    pub fn record_failure(&mut self, phase: JobPhase, error: &BackupError) {
        if self.error.is_none() {
            self.error = Some(JobFailure {
                phase,
                kind: error.kind().to_string(),
                message: error.to_string(),
            });
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn visited(&self, phase: JobPhase) -> bool {
        self.transitions.iter().any(|t| t.phase == phase)
    }
}

/// Archive name derived from the target id and a UTC timestamp in ISO 8601
/// basic format, e.g. `web-20261016T043000Z`.
pub fn archive_name(target_id: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", target_id, at.format("%Y%m%dT%H%M%SZ"))
}

/// Validate that a target id is safe to use as a path component.
pub fn validate_target_id(id: &str) -> Result<(), ConfigError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            "id",
            id,
            "only ASCII letters, digits, '-', '_' and '.' are allowed",
        ))
    }
}
