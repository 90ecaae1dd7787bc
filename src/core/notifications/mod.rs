mod slack;
mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::config::{NotificationChannelType, NotificationConfig};
use crate::core::models::{Job, JobOutcome, JobPhase};

/// Events that trigger notifications
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        job_id: String,
        target_id: String,
        container: String,
    },
    Succeeded {
        job_id: String,
        target_id: String,
        archive: String,
        total_size: u64,
        duration_secs: u64,
    },
    Failed {
        job_id: String,
        target_id: String,
        phase: JobPhase,
        error: String,
        resume_error: Option<String>,
    },
    Aborted {
        job_id: String,
        target_id: String,
        phase: JobPhase,
    },
}

impl JobEvent {
    pub fn started(job: &Job) -> Self {
        JobEvent::Started {
            job_id: job.id.clone(),
            target_id: job.target_id.clone(),
            container: job.container.name.clone(),
        }
    }

    /// Event for a finished job, `None` while it is still running.
    pub fn finished(job: &Job) -> Option<Self> {
        let failed_phase = job.error.as_ref().map(|e| e.phase).unwrap_or(job.phase);
        let event = match job.outcome? {
            JobOutcome::Succeeded => JobEvent::Succeeded {
                job_id: job.id.clone(),
                target_id: job.target_id.clone(),
                archive: job
                    .archive
                    .as_ref()
                    .map(|a| a.name.clone())
                    .unwrap_or_default(),
                total_size: job.archive.as_ref().map(|a| a.total_size).unwrap_or(0),
                duration_secs: job
                    .finished_at
                    .map(|end| (end - job.started_at).num_seconds().max(0) as u64)
                    .unwrap_or(0),
            },
            JobOutcome::Failed => JobEvent::Failed {
                job_id: job.id.clone(),
                target_id: job.target_id.clone(),
                phase: failed_phase,
                error: job
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .or_else(|| job.resume_error.clone())
                    .unwrap_or_else(|| "unknown error".to_string()),
                resume_error: job.resume_error.clone(),
            },
            JobOutcome::Aborted => JobEvent::Aborted {
                job_id: job.id.clone(),
                target_id: job.target_id.clone(),
                phase: failed_phase,
            },
        };
        Some(event)
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Started { job_id, .. }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Aborted { job_id, .. } => job_id,
        }
    }
}

/// Trait for notification channel implementations (Slack, plain webhooks, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: JobEvent) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    let webhook = config.webhook_url.as_ref().filter(|url| !url.is_empty())?;
    let hostname = config.hostname.clone();
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Slack => {
            Some(Arc::new(slack::SlackNotifier::new(webhook.clone(), hostname)))
        }
        NotificationChannelType::Json => Some(Arc::new(webhook::JsonWebhookNotifier::new(
            webhook.clone(),
            hostname,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_channel_without_url() {
        let config = NotificationConfig {
            channel: NotificationChannelType::Slack,
            webhook_url: Some(String::new()),
            hostname: None,
        };
        assert!(create_notifier(&config).is_none());

        let config = NotificationConfig {
            channel: NotificationChannelType::None,
            webhook_url: Some("http://localhost/hook".into()),
            hostname: None,
        };
        assert!(create_notifier(&config).is_none());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = JobEvent::Aborted {
            job_id: "j1".into(),
            target_id: "web".into(),
            phase: JobPhase::Capturing,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "aborted");
        assert_eq!(value["phase"], "Capturing");
        assert_eq!(event.job_id(), "j1");
    }
}
