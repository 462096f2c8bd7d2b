//! Status polling.
//!
//! The poll payload is only `{ total, processed }`, so the phase is inferred:
//! `processed == 0 < total` is exporting, `processed > 0` is importing, and
//! `(0, 0)` is either "not started" or "finished". Completion is only reported
//! for `(0, 0)` when the previous observation showed an active job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http::HttpApi;
use super::{CommandAck, CommandError, Subscription, TransportChannel};
use crate::core::machine::{Progress, StatusEnvelope, StatusEvent};
use crate::core::models::CopyCommand;
use crate::logging::LogThrottle;

const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Observed {
    #[default]
    Quiet,
    Exporting,
    Importing,
}

/// Turns successive `{ total, processed }` observations into named status events.
#[derive(Debug, Default)]
pub struct PhaseInference {
    last: Observed,
}

impl PhaseInference {
    pub fn observe(&mut self, snapshot: Progress) -> Vec<StatusEvent> {
        let mut events = Vec::new();

        if snapshot.processed > 0 {
            if self.last != Observed::Importing {
                events.push(StatusEvent::ExportDone);
            }
            events.push(StatusEvent::Importing(snapshot));
            self.last = Observed::Importing;
        } else if snapshot.total > 0 {
            events.push(StatusEvent::Exporting(snapshot));
            self.last = Observed::Exporting;
        } else {
            match self.last {
                Observed::Quiet => {}
                Observed::Exporting => {
                    events.push(StatusEvent::ExportDone);
                    events.push(StatusEvent::ImportDone { completed_at: None });
                }
                Observed::Importing => {
                    events.push(StatusEvent::ImportDone { completed_at: None });
                }
            }
            self.last = Observed::Quiet;
        }

        events
    }
}

/// Channel that polls `GET /job-status/{recordId}`.
pub struct PollingChannel {
    api: Arc<HttpApi>,
    interval: Duration,
}

impl PollingChannel {
    pub fn new(api: Arc<HttpApi>, interval: Duration) -> Self {
        Self { api, interval }
    }
}

#[async_trait]
impl TransportChannel for PollingChannel {
    async fn issue_command(&self, command: &CopyCommand) -> Result<CommandAck, CommandError> {
        self.api.issue_command(command).await
    }

    fn subscribe_to_status(
        &self,
        record_id: &str,
        events: mpsc::Sender<StatusEnvelope>,
    ) -> Subscription {
        let cancel = CancellationToken::new();
        let task = poll_loop(
            self.api.clone(),
            record_id.to_string(),
            self.interval,
            events,
            cancel.clone(),
        );
        Subscription::spawn(cancel, task)
    }
}

/// Waits `interval` after each request completes before sending the next, so
/// requests never overlap. Errors are logged (throttled) and polling continues.
async fn poll_loop(
    api: Arc<HttpApi>,
    record_id: String,
    interval: Duration,
    events: mpsc::Sender<StatusEnvelope>,
    cancel: CancellationToken,
) {
    let mut inference = PhaseInference::default();
    let throttle = LogThrottle::new(ERROR_LOG_INTERVAL);
    debug!(record_id = %record_id, interval_ms = interval.as_millis() as u64, "Status polling started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = api.job_status(&record_id) => result,
        };

        match result {
            Ok(snapshot) => {
                throttle.reset();
                for event in inference.observe(snapshot) {
                    if cancel.is_cancelled() || events.send(StatusEnvelope::new(event)).await.is_err() {
                        debug!(record_id = %record_id, "Status receiver gone, stopping poll");
                        return;
                    }
                }
            }
            Err(e) => {
                if let Some(suppressed) = throttle.check() {
                    warn!(record_id = %record_id, error = %e, suppressed, "Status poll failed, retrying");
                }
            }
        }
    }

    debug!(record_id = %record_id, "Status polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(total: u64, processed: u64) -> Progress {
        Progress { total, processed }
    }

    #[test]
    fn test_zero_counts_alone_never_complete() {
        let mut inference = PhaseInference::default();
        assert!(inference.observe(p(0, 0)).is_empty());
        assert!(inference.observe(p(0, 0)).is_empty());
    }

    #[test]
    fn test_full_job_sequence() {
        let mut inference = PhaseInference::default();

        assert_eq!(inference.observe(p(10, 0)), vec![StatusEvent::Exporting(p(10, 0))]);
        assert_eq!(inference.observe(p(10, 0)), vec![StatusEvent::Exporting(p(10, 0))]);
        assert_eq!(
            inference.observe(p(10, 3)),
            vec![StatusEvent::ExportDone, StatusEvent::Importing(p(10, 3))]
        );
        assert_eq!(inference.observe(p(10, 7)), vec![StatusEvent::Importing(p(10, 7))]);
        assert_eq!(
            inference.observe(p(0, 0)),
            vec![StatusEvent::ImportDone { completed_at: None }]
        );
        assert!(inference.observe(p(0, 0)).is_empty());
    }

    #[test]
    fn test_job_finishing_between_polls() {
        let mut inference = PhaseInference::default();
        inference.observe(p(4, 0));

        assert_eq!(
            inference.observe(p(0, 0)),
            vec![
                StatusEvent::ExportDone,
                StatusEvent::ImportDone { completed_at: None }
            ]
        );
    }

    #[test]
    fn test_missed_export_phase() {
        let mut inference = PhaseInference::default();
        assert_eq!(
            inference.observe(p(5, 1)),
            vec![StatusEvent::ExportDone, StatusEvent::Importing(p(5, 1))]
        );
    }
}
