use super::{JobEvent, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    hostname: Option<String>,
    client: reqwest::Client,
}

fn short(job_id: &str) -> &str {
    &job_id[..8.min(job_id.len())]
}

fn field(label: &str, value: String) -> serde_json::Value {
    json!({
        "type": "mrkdwn",
        "text": format!("*{}:*\n{}", label, value)
    })
}

impl SlackNotifier {
    pub fn new(webhook_url: String, hostname: Option<String>) -> Self {
        Self {
            webhook_url,
            hostname,
            client: reqwest::Client::new(),
        }
    }

    fn header(&self, title: &str) -> serde_json::Value {
        let text = match &self.hostname {
            Some(host) => format!("{} ({})", title, host),
            None => title.to_string(),
        };
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": text,
                "emoji": true
            }
        })
    }

    fn format_message(&self, event: &JobEvent) -> serde_json::Value {
        match event {
            JobEvent::Started {
                job_id,
                target_id,
                container,
            } => json!({
                "blocks": [
                    self.header("Backup Started"),
                    {
                        "type": "section",
                        "fields": [
                            field("Target", target_id.clone()),
                            field("Job ID", format!("`{}`", short(job_id))),
                            field("Container", format!("`{}`", container)),
                        ]
                    }
                ]
            }),
            JobEvent::Succeeded {
                job_id,
                target_id,
                archive,
                total_size,
                duration_secs,
            } => {
                let size_mb = *total_size as f64 / (1024.0 * 1024.0);
                json!({
                    "blocks": [
                        self.header("Backup Complete"),
                        {
                            "type": "section",
                            "fields": [
                                field("Target", target_id.clone()),
                                field("Job ID", format!("`{}`", short(job_id))),
                                field("Archive", format!("`{}`", archive)),
                                field("Size", format!("{:.1} MB in {}s", size_mb, duration_secs)),
                            ]
                        }
                    ]
                })
            }
            JobEvent::Failed {
                job_id,
                target_id,
                phase,
                error,
                resume_error,
            } => {
                let mut blocks = vec![
                    self.header("Backup Failed"),
                    json!({
                        "type": "section",
                        "fields": [
                            field("Target", target_id.clone()),
                            field("Job ID", format!("`{}`", short(job_id))),
                            field("Phase", phase.to_string()),
                        ]
                    }),
                    json!({
                        "type": "section",
                        "text": {
                            "type": "mrkdwn",
                            "text": format!("*Error:*\n```{}```", error)
                        }
                    }),
                ];
                if let Some(resume_error) = resume_error {
                    blocks.push(json!({
                        "type": "section",
                        "text": {
                            "type": "mrkdwn",
                            "text": format!("*Container may still be quiesced:*\n```{}```", resume_error)
                        }
                    }));
                }
                json!({ "blocks": blocks })
            }
            JobEvent::Aborted {
                job_id,
                target_id,
                phase,
            } => json!({
                "blocks": [
                    self.header("Backup Aborted"),
                    {
                        "type": "section",
                        "fields": [
                            field("Target", target_id.clone()),
                            field("Job ID", format!("`{}`", short(job_id))),
                            field("Phase", phase.to_string()),
                        ]
                    }
                ]
            }),
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let payload = self.format_message(&event);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
