mod webhook;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::core::machine::JobPhase;

pub use webhook::WebhookNotifier;

/// Outcome shown to the operator once a job resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    Succeeded {
        record_id: String,
        completed_at: DateTime<Utc>,
    },
    Failed {
        record_id: String,
        reason: String,
    },
}

impl JobReport {
    /// Report for a terminal phase, `None` for anything else.
    pub fn from_phase(record_id: &str, phase: &JobPhase) -> Option<Self> {
        match phase {
            JobPhase::Done(completed_at) => Some(JobReport::Succeeded {
                record_id: record_id.to_string(),
                completed_at: *completed_at,
            }),
            JobPhase::Failed(reason) => Some(JobReport::Failed {
                record_id: record_id.to_string(),
                reason: reason.clone(),
            }),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            JobReport::Succeeded { .. } => "Copy content successful!".to_string(),
            JobReport::Failed { reason, .. } => format!("Something went wrong: {}", reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobReport::Succeeded { .. })
    }
}

/// The single path every user-visible result goes through.
#[async_trait]
pub trait ResultNotifier: Send + Sync {
    async fn notify(&self, report: JobReport) -> Result<()>;
}

/// Writes results to the log.
pub struct LogNotifier;

#[async_trait]
impl ResultNotifier for LogNotifier {
    async fn notify(&self, report: JobReport) -> Result<()> {
        match &report {
            JobReport::Succeeded {
                record_id,
                completed_at,
            } => info!(record_id = %record_id, completed_at = %completed_at, "{}", report.message()),
            JobReport::Failed { record_id, .. } => {
                error!(record_id = %record_id, "{}", report.message())
            }
        }
        Ok(())
    }
}

/// Webhook notifier when one is configured, log notifier otherwise.
pub fn create_notifier(config: &AppConfig) -> Arc<dyn ResultNotifier> {
    match config.webhook_url.as_deref() {
        Some(url) if !url.is_empty() => {
            match WebhookNotifier::new(url.to_string(), config.request_timeout()) {
                Ok(notifier) => Arc::new(notifier),
                Err(e) => {
                    warn!(error = %e, "Failed to build webhook client, reporting to log");
                    Arc::new(LogNotifier)
                }
            }
        }
        _ => Arc::new(LogNotifier),
    }
}
