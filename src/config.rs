use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::models::{PhaseTimeouts, QuiesceAction, RetentionPolicy, RetryPolicies, RetryPolicy};

const DEFAULT_CONFIG_PATH: &str = "/etc/stowd/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Label namespace, e.g. `stowd` for `stowd.enable=true`.
    pub label_prefix: String,
    pub archive_directory: PathBuf,
    /// Job staging area; defaults to `<archive_directory>/.staging`.
    pub staging_directory: Option<PathBuf>,
    pub database_path: PathBuf,
    pub max_concurrent_jobs: usize,
    pub discovery_interval_secs: u64,
    /// Upper bound for one discovery pass against the runtime.
    pub discovery_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub rpc_bind: SocketAddr,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub defaults: TargetDefaults,
    pub storage: StorageConfig,
    pub notifications: NotificationConfig,
}

/// Values applied to every target unless its labels override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDefaults {
    pub quiesce: QuiesceAction,
    pub hook_attempts: u32,
    pub capture_attempts: u32,
    pub resume_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub hook_timeout_secs: u64,
    pub quiesce_timeout_secs: u64,
    pub capture_timeout_secs: u64,
    pub archive_timeout_secs: u64,
    pub resume_timeout_secs: u64,
    pub keep_last: usize,
    pub max_age_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub write_attempts: u32,
    pub write_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    None,
    Slack,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    pub webhook_url: Option<String>,
    /// Reported as the originating host in notifications.
    pub hostname: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            label_prefix: "stowd".to_string(),
            archive_directory: PathBuf::from("/var/lib/stowd/archives"),
            staging_directory: None,
            database_path: PathBuf::from("/var/lib/stowd/stowd.db"),
            max_concurrent_jobs: 2,
            discovery_interval_secs: 60,
            discovery_timeout_secs: 30,
            shutdown_timeout_secs: 120,
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7345)),
            simulation: false,
            verbose: false,
            json_logs: false,
            defaults: TargetDefaults::default(),
            storage: StorageConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for TargetDefaults {
    fn default() -> Self {
        Self {
            quiesce: QuiesceAction::Pause,
            hook_attempts: 3,
            capture_attempts: 3,
            resume_attempts: 5,
            backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            hook_timeout_secs: 300,
            quiesce_timeout_secs: 60,
            capture_timeout_secs: 3_600,
            archive_timeout_secs: 3_600,
            resume_timeout_secs: 60,
            keep_last: 7,
            max_age_days: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            write_backoff_ms: 2_000,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: NotificationChannelType::None,
            webhook_url: None,
            hostname: None,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML config file, `STOWD_*` environment variables and
    /// finally any CLI overrides.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self, figment::Error> {
        let path = std::env::var("STOWD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::figment(PathBuf::from(path), overrides).extract()
    }

    pub fn figment<T: Serialize>(path: PathBuf, overrides: Option<&T>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("STOWD_").ignore(&["config"]).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        figment
    }

    pub fn staging_directory(&self) -> PathBuf {
        self.staging_directory
            .clone()
            .unwrap_or_else(|| self.archive_directory.join(".staging"))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn sink_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.storage.write_attempts.max(1),
            initial_backoff: Duration::from_millis(self.storage.write_backoff_ms),
            max_backoff: Duration::from_millis(self.storage.write_backoff_ms.saturating_mul(8)),
        }
    }
}

impl TargetDefaults {
    pub fn retry_policy(&self, attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts.max(1),
            initial_backoff: Duration::from_millis(self.backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.backoff_ms)),
        }
    }

    pub fn retry(&self) -> RetryPolicies {
        RetryPolicies {
            hook: self.retry_policy(self.hook_attempts),
            capture: self.retry_policy(self.capture_attempts),
            resume: self.retry_policy(self.resume_attempts),
        }
    }

    pub fn timeouts(&self) -> PhaseTimeouts {
        PhaseTimeouts {
            hook: Duration::from_secs(self.hook_timeout_secs),
            quiesce: Duration::from_secs(self.quiesce_timeout_secs),
            capture: Duration::from_secs(self.capture_timeout_secs),
            archive: Duration::from_secs(self.archive_timeout_secs),
            resume: Duration::from_secs(self.resume_timeout_secs),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_last: self.keep_last,
            max_age_days: self.max_age_days,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_extract_without_file() {
        let config: AppConfig = AppConfig::figment(
            PathBuf::from("/nonexistent/stowd.toml"),
            None::<&HashMap<String, String>>,
        )
        .extract()
        .unwrap();

        assert_eq!(config.label_prefix, "stowd");
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(
            config.staging_directory(),
            PathBuf::from("/var/lib/stowd/archives/.staging")
        );
    }

    #[test]
    fn toml_file_and_overrides_layer_in_order() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
max_concurrent_jobs = 8
archive_directory = "/srv/backups"

[defaults]
capture_attempts = 1
keep_last = 30
"#,
        )
        .unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("archive_directory".to_string(), "/mnt/override".to_string());

        let config: AppConfig = AppConfig::figment(path, Some(&overrides))
            .extract()
            .unwrap();

        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.archive_directory, PathBuf::from("/mnt/override"));
        assert_eq!(config.defaults.capture_attempts, 1);
        assert_eq!(config.defaults.keep_last, 30);
        // untouched nested defaults survive the merge
        assert_eq!(config.defaults.resume_attempts, 5);
    }

    #[test]
    fn retry_policies_are_independent() {
        let defaults = TargetDefaults {
            hook_attempts: 1,
            capture_attempts: 4,
            resume_attempts: 0,
            ..TargetDefaults::default()
        };
        let retry = defaults.retry();
        assert_eq!(retry.hook.max_attempts, 1);
        assert_eq!(retry.capture.max_attempts, 4);
        assert_eq!(retry.resume.max_attempts, 1);
    }
}
