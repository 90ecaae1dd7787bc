use super::{JobEvent, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

/// Posts every event as a flat JSON object.
pub struct JsonWebhookNotifier {
    webhook_url: String,
    hostname: Option<String>,
    client: reqwest::Client,
}

impl JsonWebhookNotifier {
    pub fn new(webhook_url: String, hostname: Option<String>) -> Self {
        Self {
            webhook_url,
            hostname,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &JobEvent) -> Result<serde_json::Value> {
        let mut payload = serde_json::to_value(event)?;
        if let Some(map) = payload.as_object_mut() {
            map.insert("sent_at".into(), json!(Utc::now()));
            if let Some(hostname) = &self.hostname {
                map.insert("hostname".into(), json!(hostname));
            }
        }
        Ok(payload)
    }
}

#[async_trait]
impl NotificationChannel for JsonWebhookNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let payload = self.format_message(&event)?;
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_hostname() {
        let notifier = JsonWebhookNotifier::new("http://localhost".into(), Some("nas".into()));
        let payload = notifier
            .format_message(&JobEvent::Started {
                job_id: "j1".into(),
                target_id: "db".into(),
                container: "db".into(),
            })
            .unwrap();

        assert_eq!(payload["event"], "started");
        assert_eq!(payload["hostname"], "nas");
        assert_eq!(payload["target_id"], "db");
    }
}
