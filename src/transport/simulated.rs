//! In-process transport for `--simulation` runs and tests.
//!
//! `SimulatedTransport` is the channel handed to a session; `SimulatorHandle`
//! drives it from the outside (inject events, reject commands, inspect what was
//! sent).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CommandAck, CommandError, Subscription, TransportChannel, TransportError};
use crate::core::machine::{Progress, StatusEnvelope, StatusEvent};
use crate::core::models::CopyCommand;

/// How the next command should be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    InFlight,
    Invalid(String),
    Unreachable,
}

/// Timing and size of the job played back after each accepted command.
#[derive(Debug, Clone, Copy)]
pub struct JobScript {
    pub step: Duration,
    pub total: u64,
    pub queue_position: Option<u32>,
}

impl Default for JobScript {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(400),
            total: 25,
            queue_position: Some(1),
        }
    }
}

struct Subscriber {
    cancel: CancellationToken,
    tx: mpsc::Sender<StatusEnvelope>,
}

#[derive(Default)]
struct SimState {
    subscribers: HashMap<String, Vec<Subscriber>>,
    in_flight: HashSet<String>,
    commands: Vec<CopyCommand>,
    reject_next: Option<Rejection>,
}

impl SimState {
    /// Drop cancelled subscribers of `record_id`, returning the live ones.
    fn live_subscribers(&mut self, record_id: &str) -> &mut Vec<Subscriber> {
        let subs = self.subscribers.entry(record_id.to_string()).or_default();
        subs.retain(|s| !s.cancel.is_cancelled());
        subs
    }
}

type Shared = Arc<Mutex<SimState>>;

fn lock(state: &Shared) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimulatedTransport {
    state: Shared,
    script: Option<JobScript>,
}

#[derive(Clone)]
pub struct SimulatorHandle {
    state: Shared,
}

impl SimulatedTransport {
    /// Transport whose jobs only progress when the handle emits events.
    pub fn new() -> (Self, SimulatorHandle) {
        Self::build(None)
    }

    /// Transport that plays `script` for every accepted command.
    pub fn scripted(script: JobScript) -> (Self, SimulatorHandle) {
        Self::build(Some(script))
    }

    fn build(script: Option<JobScript>) -> (Self, SimulatorHandle) {
        let state: Shared = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: state.clone(),
                script,
            },
            SimulatorHandle { state },
        )
    }
}

impl SimulatorHandle {
    /// Deliver an event to every live subscriber of `record_id`. A terminal event
    /// also resolves the in-flight job for the record.
    pub async fn emit(&self, record_id: &str, envelope: StatusEnvelope) {
        emit(&self.state, record_id, envelope).await;
    }

    pub fn reject_next(&self, rejection: Rejection) {
        lock(&self.state).reject_next = Some(rejection);
    }

    pub fn commands(&self) -> Vec<CopyCommand> {
        lock(&self.state).commands.clone()
    }

    pub fn subscriber_count(&self, record_id: &str) -> usize {
        lock(&self.state)
            .subscribers
            .get(record_id)
            .map_or(0, |subs| subs.iter().filter(|s| !s.cancel.is_cancelled()).count())
    }

    pub fn is_in_flight(&self, record_id: &str) -> bool {
        lock(&self.state).in_flight.contains(record_id)
    }
}

async fn emit(state: &Shared, record_id: &str, envelope: StatusEnvelope) {
    let targets: Vec<mpsc::Sender<StatusEnvelope>> = {
        let mut state = lock(state);
        if matches!(
            envelope.event,
            StatusEvent::ImportDone { .. } | StatusEvent::Failed { .. }
        ) {
            state.in_flight.remove(record_id);
        }
        state
            .live_subscribers(record_id)
            .iter()
            .map(|s| s.tx.clone())
            .collect()
    };

    debug!(record_id, event = envelope.event.name(), subscribers = targets.len(), "Simulated event");
    for tx in targets {
        let _ = tx.send(envelope.clone()).await;
    }
}

async fn play(state: Shared, record_id: String, command: CopyCommand, script: JobScript) {
    let job_id = command.job_id;
    let send = |event| emit(&state, &record_id, StatusEnvelope::for_job(job_id, event));

    if let Some(position) = script.queue_position {
        send(StatusEvent::Queued { position }).await;
        sleep(script.step).await;
    }

    send(StatusEvent::Exporting(Progress {
        total: script.total,
        processed: 0,
    }))
    .await;
    sleep(script.step).await;
    send(StatusEvent::ExportDone).await;

    let chunk = (script.total / 5).max(1);
    let mut processed = 0;
    while processed < script.total {
        processed = (processed + chunk).min(script.total);
        send(StatusEvent::Importing(Progress {
            total: script.total,
            processed,
        }))
        .await;
        sleep(script.step).await;
    }

    send(StatusEvent::ImportDone {
        completed_at: Some(Utc::now()),
    })
    .await;
}

#[async_trait]
impl TransportChannel for SimulatedTransport {
    async fn issue_command(&self, command: &CopyCommand) -> Result<CommandAck, CommandError> {
        let record_id = command.record_id().to_string();
        {
            let mut state = lock(&self.state);
            state.commands.push(command.clone());

            match state.reject_next.take() {
                Some(Rejection::InFlight) => return Err(CommandError::JobAlreadyInFlight),
                Some(Rejection::Invalid(msg)) => return Err(CommandError::Rejected(msg)),
                Some(Rejection::Unreachable) => {
                    return Err(TransportError::Status(503).into());
                }
                None => {}
            }

            if !state.in_flight.insert(record_id.clone()) {
                return Err(CommandError::JobAlreadyInFlight);
            }
        }

        if let Some(script) = self.script {
            tokio::spawn(play(self.state.clone(), record_id, command.clone(), script));
        }

        Ok(CommandAck {
            job_id: command.job_id,
        })
    }

    fn subscribe_to_status(
        &self,
        record_id: &str,
        events: mpsc::Sender<StatusEnvelope>,
    ) -> Subscription {
        let cancel = CancellationToken::new();
        lock(&self.state)
            .live_subscribers(record_id)
            .push(Subscriber {
                cancel: cancel.clone(),
                tx: events,
            });

        Subscription::detached(cancel)
    }
}
