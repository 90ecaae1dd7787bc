//! Target discovery from container labels.
//!
//! Containers opt in with `<prefix>.enable=true`. Every other setting is read
//! from `<prefix>.*` labels and validated here, so the rest of the daemon only
//! ever sees typed [`BackupTarget`]s. A bad label rejects that one container.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::TargetDefaults;
use crate::core::models::{
    BackupTarget, ExitCodeBehaviour, HookCommand, QuiesceAction, RetentionPolicy, VolumeSpec,
    validate_target_id,
};
use crate::core::runtime::{ContainerInfo, ContainerRuntime};
use crate::error::{ConfigError, RuntimeError};

/// A container that asked to be backed up but could not be parsed.
#[derive(Debug, Clone)]
pub struct RejectedTarget {
    pub container: String,
    pub error: ConfigError,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub targets: Vec<Arc<BackupTarget>>,
    pub rejected: Vec<RejectedTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

pub struct TargetRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    prefix: String,
    defaults: TargetDefaults,
    targets: RwLock<BTreeMap<String, Arc<BackupTarget>>>,
}

impl TargetRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, prefix: &str, defaults: TargetDefaults) -> Self {
        Self {
            runtime,
            prefix: prefix.to_string(),
            defaults,
            targets: RwLock::new(BTreeMap::new()),
        }
    }

    /// Query the runtime and parse every opted-in container.
    pub async fn discover(&self) -> Result<DiscoveryReport, RuntimeError> {
        let enable = format!("{}.enable", self.prefix);
        let root = format!("{}.root", self.prefix);

        let mut containers = self.runtime.list_containers(&enable).await?;
        containers.sort_by(|a, b| a.reference.id.cmp(&b.reference.id));

        let mut report = DiscoveryReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        for container in containers {
            if container.labels.contains_key(&root) {
                debug!(container = %container.reference, "Skipping own container");
                continue;
            }

            let parsed = parse_target(&self.prefix, &self.defaults, &container).and_then(
                |target| match target {
                    Some(t) if seen.contains(&t.id) => Err(ConfigError::DuplicateTarget(t.id)),
                    other => Ok(other),
                },
            );

            match parsed {
                Ok(Some(target)) => {
                    seen.insert(target.id.clone());
                    report.targets.push(Arc::new(target));
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        container = %container.reference,
                        error = %error,
                        "Ignoring container with invalid backup labels"
                    );
                    report.rejected.push(RejectedTarget {
                        container: container.reference.name.clone(),
                        error,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Run discovery and replace the current target set.
    pub async fn refresh(&self) -> Result<(DiscoveryReport, RegistryChanges), RuntimeError> {
        let report = self.discover().await?;
        let changes = self.replace(&report.targets);

        if !changes.added.is_empty() || !changes.removed.is_empty() || !changes.updated.is_empty()
        {
            info!(
                added = ?changes.added,
                removed = ?changes.removed,
                updated = ?changes.updated,
                total = report.targets.len(),
                "Backup targets changed"
            );
        }
        Ok((report, changes))
    }

    pub fn replace(&self, targets: &[Arc<BackupTarget>]) -> RegistryChanges {
        let next: BTreeMap<String, Arc<BackupTarget>> = targets
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();

        let mut current = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        let mut changes = RegistryChanges::default();

        for (id, target) in &next {
            match current.get(id) {
                None => changes.added.push(id.clone()),
                Some(old) if old.as_ref() != target.as_ref() => changes.updated.push(id.clone()),
                Some(_) => {}
            }
        }
        for id in current.keys() {
            if !next.contains_key(id) {
                changes.removed.push(id.clone());
            }
        }

        *current = next;
        changes
    }

    pub fn get(&self, id: &str) -> Option<Arc<BackupTarget>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<BackupTarget>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Turn one container's labels into a target.
///
/// Returns `Ok(None)` when the container carries the enable label with a value
/// other than `true`.
pub fn parse_target(
    prefix: &str,
    defaults: &TargetDefaults,
    container: &ContainerInfo,
) -> Result<Option<BackupTarget>, ConfigError> {
    let labels = Labels {
        prefix,
        map: &container.labels,
    };

    match labels.get("enable") {
        Some(v) if v.trim().eq_ignore_ascii_case("true") => {}
        Some(_) => return Ok(None),
        None => return Err(ConfigError::MissingLabel(labels.key("enable"))),
    }

    let id = labels
        .get("id")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| container.reference.name.trim_start_matches('/').to_string());
    validate_target_id(&id).map_err(|_| ConfigError::invalid(&labels.key("id"), &id, "not a valid target id"))?;

    let schedule = labels
        .get("schedule")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingLabel(labels.key("schedule")))?;

    let volumes = parse_volumes(&labels)?;

    let hook_user = labels.get("hook.user").map(|s| s.trim().to_string());
    let exit_codes = match labels.get("hook.exit_codes") {
        Some(value) => ExitCodeBehaviour::parse(value)
            .map_err(|reason| ConfigError::invalid(&labels.key("hook.exit_codes"), value, reason))?,
        None => ExitCodeBehaviour::FailIfNonZero,
    };
    let hook = |name: &str| {
        labels
            .get(name)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|command| HookCommand {
                command: command.to_string(),
                user: hook_user.clone(),
                exit_codes: exit_codes.clone(),
            })
    };
    let pre_hook = hook("hook.pre");
    let post_hook = hook("hook.post");

    // containers with hooks default to ignore
    let default_action = if pre_hook.is_some() || post_hook.is_some() {
        QuiesceAction::Ignore
    } else {
        defaults.quiesce
    };
    let quiesce = match labels.get("action") {
        Some(value) => QuiesceAction::parse(value).ok_or_else(|| {
            ConfigError::invalid(&labels.key("action"), value, "expected pause, stop or ignore")
        })?,
        None => default_action,
    };

    let mut retry = defaults.retry();
    if let Some(n) = labels.number::<u32>("retry.hook.attempts")? {
        retry.hook = defaults.retry_policy(n);
    }
    if let Some(n) = labels.number::<u32>("retry.capture.attempts")? {
        retry.capture = defaults.retry_policy(n);
    }
    if let Some(n) = labels.number::<u32>("retry.resume.attempts")? {
        retry.resume = defaults.retry_policy(n);
    }
    if let Some(ms) = labels.number::<u64>("retry.backoff_ms")? {
        for policy in [&mut retry.hook, &mut retry.capture, &mut retry.resume] {
            policy.initial_backoff = Duration::from_millis(ms);
            policy.max_backoff = policy.max_backoff.max(policy.initial_backoff);
        }
    }

    let mut timeouts = defaults.timeouts();
    if let Some(secs) = labels.number::<u64>("timeout.capture_secs")? {
        timeouts.capture = Duration::from_secs(secs);
    }
    if let Some(secs) = labels.number::<u64>("timeout.hook_secs")? {
        timeouts.hook = Duration::from_secs(secs);
    }

    let mut retention: RetentionPolicy = defaults.retention();
    if let Some(keep) = labels.number::<usize>("retention.keep_last")? {
        retention.keep_last = keep;
    }
    if let Some(days) = labels.number::<u32>("retention.max_age_days")? {
        retention.max_age_days = Some(days);
    }

    Ok(Some(BackupTarget {
        id,
        container: container.reference.clone(),
        schedule,
        volumes,
        pre_hook,
        post_hook,
        quiesce,
        retry,
        timeouts,
        retention,
    }))
}

fn parse_volumes(labels: &Labels<'_>) -> Result<Vec<VolumeSpec>, ConfigError> {
    let key = labels.key("volumes");
    let raw = labels
        .get("volumes")
        .ok_or_else(|| ConfigError::MissingLabel(key.clone()))?;

    let mut volumes: Vec<VolumeSpec> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, path) = match item.split_once(':') {
            Some((name, path)) => (name.trim().to_string(), path.trim().to_string()),
            None => (volume_name_from_path(item), item.to_string()),
        };

        if !path.starts_with('/') {
            return Err(ConfigError::invalid(&key, item, "volume path must be absolute"));
        }
        if name.is_empty() {
            return Err(ConfigError::invalid(&key, item, "volume name must not be empty"));
        }
        if volumes.iter().any(|v| v.name == name) {
            return Err(ConfigError::invalid(&key, item, "duplicate volume name"));
        }
        volumes.push(VolumeSpec { name, path });
    }

    if volumes.is_empty() {
        return Err(ConfigError::invalid(&key, raw, "at least one volume is required"));
    }
    Ok(volumes)
}

fn volume_name_from_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "root".to_string();
    }
    trimmed.replace('/', "_")
}

struct Labels<'a> {
    prefix: &'a str,
    map: &'a HashMap<String, String>,
}

impl Labels<'_> {
    fn key(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&self.key(name)).map(String::as_str)
    }

    fn number<N>(&self, name: &str) -> Result<Option<N>, ConfigError>
    where
        N: std::str::FromStr,
        N::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(value) => value
                .trim()
                .parse::<N>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(&self.key(name), value, e.to_string())),
            None => Ok(None),
        }
    }
}
