//! Push status channel over a server-sent event stream.
//!
//! One connection per subscribed record. When the stream drops, the channel
//! waits `reconnect_delay` and reconnects with the same parameters. Replayed
//! events after a reconnect are harmless: the state machine ignores anything
//! that does not apply to its current phase.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http::HttpApi;
use super::{CommandAck, CommandError, Subscription, TransportChannel, TransportError};
use crate::core::machine::{Progress, StatusEnvelope, StatusEvent};
use crate::core::models::{CopyCommand, JobId};
use crate::logging::LogThrottle;

const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw bytes, returning every frame completed by them. Bytes are only
    /// decoded once their line is complete, so a character split across chunks
    /// survives.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.take_frame() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload {
    job_id: Option<JobId>,
    total: Option<u64>,
    processed: Option<u64>,
    position: Option<u32>,
    date: Option<DateTime<Utc>>,
    reason: Option<String>,
}

/// Map a named frame to a status event.
pub fn decode_frame(frame: &SseFrame) -> Result<StatusEnvelope, TransportError> {
    let payload: EventPayload = if frame.data.trim().is_empty() {
        EventPayload::default()
    } else {
        serde_json::from_str(&frame.data).map_err(|e| TransportError::Decode(e.to_string()))?
    };

    let progress = || Progress {
        total: payload.total.unwrap_or(0),
        processed: payload.processed.unwrap_or(0),
    };

    let event = match frame.event.as_str() {
        "queued" => StatusEvent::Queued {
            position: payload
                .position
                .ok_or_else(|| TransportError::Decode("queued event without position".to_string()))?,
        },
        "exporting" => StatusEvent::Exporting(progress()),
        "exportDone" => StatusEvent::ExportDone,
        "importing" => StatusEvent::Importing(progress()),
        "importDone" => StatusEvent::ImportDone {
            completed_at: payload.date,
        },
        "failed" => StatusEvent::Failed {
            reason: payload
                .reason
                .clone()
                .unwrap_or_else(|| "copy failed".to_string()),
        },
        other => return Err(TransportError::Decode(format!("unknown event: {}", other))),
    };

    Ok(StatusEnvelope {
        job_id: payload.job_id,
        event,
    })
}

/// Channel that listens on `GET /job-events/{recordId}`.
pub struct PushChannel {
    api: Arc<HttpApi>,
    reconnect_delay: Duration,
}

impl PushChannel {
    pub fn new(api: Arc<HttpApi>, reconnect_delay: Duration) -> Self {
        Self {
            api,
            reconnect_delay,
        }
    }
}

#[async_trait]
impl TransportChannel for PushChannel {
    async fn issue_command(&self, command: &CopyCommand) -> Result<CommandAck, CommandError> {
        self.api.issue_command(command).await
    }

    fn subscribe_to_status(
        &self,
        record_id: &str,
        events: mpsc::Sender<StatusEnvelope>,
    ) -> Subscription {
        let cancel = CancellationToken::new();
        let task = stream_loop(
            self.api.clone(),
            record_id.to_string(),
            self.reconnect_delay,
            events,
            cancel.clone(),
        );
        Subscription::spawn(cancel, task)
    }
}

async fn stream_loop(
    api: Arc<HttpApi>,
    record_id: String,
    reconnect_delay: Duration,
    events: mpsc::Sender<StatusEnvelope>,
    cancel: CancellationToken,
) {
    let throttle = LogThrottle::new(ERROR_LOG_INTERVAL);
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = stream_once(&api, &record_id, &events, &throttle) => result,
        };

        match result {
            Ok(()) => info!(record_id = %record_id, attempt, "Event stream closed, reconnecting"),
            Err(TransportError::Closed) => {
                debug!(record_id = %record_id, "Status receiver gone, closing stream");
                return;
            }
            Err(e) => {
                if let Some(suppressed) = throttle.check() {
                    warn!(record_id = %record_id, attempt, error = %e, suppressed, "Event stream failed, reconnecting");
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(reconnect_delay) => {}
        }
    }

    debug!(record_id = %record_id, "Event stream subscription stopped");
}

async fn stream_once(
    api: &HttpApi,
    record_id: &str,
    events: &mpsc::Sender<StatusEnvelope>,
    throttle: &LogThrottle,
) -> Result<(), TransportError> {
    let response = api.events_request(record_id).send().await?;
    if !response.status().is_success() {
        return Err(TransportError::Status(response.status().as_u16()));
    }

    debug!(record_id = %record_id, "Event stream connected");
    throttle.reset();

    let mut decoder = SseDecoder::default();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for frame in decoder.push(&chunk) {
            match decode_frame(&frame) {
                Ok(envelope) => {
                    if events.send(envelope).await.is_err() {
                        return Err(TransportError::Closed);
                    }
                }
                Err(e) => warn!(record_id = %record_id, event = %frame.event, error = %e, "Skipping malformed event"),
            }
        }
    }

    Ok(())
}
