//! Transport channels: how copy commands reach the server and how job status
//! comes back.
//!
//! ## Architecture
//!
//! - `http`: reqwest client shared by the HTTP channels, plus the directory lookup
//! - `poll`: request/response status polling with phase inference
//! - `push`: server-sent event stream with automatic reconnection
//! - `simulated`: in-process channel for simulation mode and tests
//!
//! A status subscription is an explicit [`Subscription`] handle. Cancelling it (or
//! dropping it) stops the background task; nothing reschedules itself after that.

pub mod http;
pub mod poll;
pub mod push;
pub mod simulated;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, StatusChannelKind};
use crate::core::machine::StatusEnvelope;
use crate::core::models::{CopyCommand, JobId};

pub use http::{HttpApi, HttpDirectory};
pub use poll::{PhaseInference, PollingChannel};
pub use push::PushChannel;
pub use simulated::{SimulatedTransport, SimulatorHandle};

/// Transient channel failure. Logged and retried, never fatal to a subscription.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("status receiver closed")]
    Closed,
}

/// Why the server did not accept a copy command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("a copy job for this record is already in flight")]
    JobAlreadyInFlight,
    #[error("copy request rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Server acknowledgement that a job was queued. The outcome arrives later on
/// the status subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub job_id: JobId,
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Submit a copy job. Returns once the server has accepted it.
    async fn issue_command(&self, command: &CopyCommand) -> Result<CommandAck, CommandError>;

    /// Start delivering status events for `record_id` into `events`.
    /// Must be called from within a tokio runtime.
    fn subscribe_to_status(
        &self,
        record_id: &str,
        events: mpsc::Sender<StatusEnvelope>,
    ) -> Subscription;
}

/// Handle to a running status subscription.
pub struct Subscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Spawn `task` as the subscription body. The task should watch `cancel`
    /// and return promptly once it fires.
    pub fn spawn<F>(cancel: CancellationToken, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            cancel,
            task: Some(tokio::spawn(task)),
        }
    }

    /// Subscription with no background task. The producer checks `cancel` before delivering.
    pub fn detached(cancel: CancellationToken) -> Self {
        Self { cancel, task: None }
    }

    /// Stop the subscription. Synchronous and idempotent.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Build the channel selected in the configuration.
pub fn create_channel(config: &AppConfig) -> Result<Arc<dyn TransportChannel>, TransportError> {
    let api = Arc::new(HttpApi::new(
        config.copy_base_url(),
        config.request_timeout(),
    )?);

    Ok(match config.status_channel {
        StatusChannelKind::Poll => Arc::new(PollingChannel::new(api, config.poll_interval())),
        StatusChannelKind::Push => Arc::new(PushChannel::new(api, config.reconnect_delay())),
    })
}
