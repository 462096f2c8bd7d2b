use std::time::Duration;

use super::{JobReport, ResultNotifier};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

/// Posts job results as JSON to a webhook.
pub struct WebhookNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// `timeout` bounds each delivery so a stalled webhook cannot hold up status updates.
    pub fn new(webhook_url: String, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            webhook_url,
            client,
        })
    }

    fn format_message(&self, report: &JobReport) -> serde_json::Value {
        match report {
            JobReport::Succeeded {
                record_id,
                completed_at,
            } => json!({
                "status": "success",
                "recordId": record_id,
                "completedAt": completed_at.to_rfc3339(),
                "text": report.message(),
            }),
            JobReport::Failed { record_id, reason } => json!({
                "status": "error",
                "recordId": record_id,
                "reason": reason,
                "text": report.message(),
            }),
        }
    }
}

#[async_trait]
impl ResultNotifier for WebhookNotifier {
    async fn notify(&self, report: JobReport) -> Result<()> {
        let payload = self.format_message(&report);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
