//! Job status state machine.
//!
//! Owns the phase of the single copy job tracked by a session. Every change goes
//! through [`transition`], a pure function of (current phase, event) that returns
//! `None` for events with no defined transition. Duplicate, stale or out-of-order
//! deliveries from the status channels therefore fall through as no-ops instead of
//! corrupting the state.
//!
//! The UI side only ever reads: it holds a `watch::Receiver<JobState>` obtained from
//! [`JobStatusMachine::subscribe`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use super::models::JobId;

/// Item counters reported while exporting or importing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Progress {
    pub total: u64,
    pub processed: u64,
}

impl Progress {
    /// Build a progress value, clamping `processed` to `total` when it overshoots.
    pub fn clamped(total: u64, processed: u64) -> Self {
        Self {
            total,
            processed: processed.min(total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Exporting(Progress),
    QueuedAt(u32),
    Importing(Progress),
    Done(DateTime<Utc>),
    Failed(String),
}

impl JobPhase {
    pub fn name(&self) -> &'static str {
        match self {
            JobPhase::Idle => "idle",
            JobPhase::Exporting(_) => "exporting",
            JobPhase::QueuedAt(_) => "queued",
            JobPhase::Importing(_) => "importing",
            JobPhase::Done(_) => "done",
            JobPhase::Failed(_) => "failed",
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            JobPhase::Exporting(_) | JobPhase::QueuedAt(_) | JobPhase::Importing(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Done(_) | JobPhase::Failed(_))
    }
}

/// Which half of the copy a progress value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Exporting,
    Importing,
}

/// Status events delivered by a transport channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Queued { position: u32 },
    Exporting(Progress),
    ExportDone,
    Importing(Progress),
    ImportDone { completed_at: Option<DateTime<Utc>> },
    Failed { reason: String },
}

impl StatusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Queued { .. } => "queued",
            StatusEvent::Exporting(_) => "exporting",
            StatusEvent::ExportDone => "exportDone",
            StatusEvent::Importing(_) => "importing",
            StatusEvent::ImportDone { .. } => "importDone",
            StatusEvent::Failed { .. } => "failed",
        }
    }
}

/// A status event plus the job it belongs to, when the channel knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEnvelope {
    pub job_id: Option<JobId>,
    pub event: StatusEvent,
}

impl StatusEnvelope {
    pub fn new(event: StatusEvent) -> Self {
        Self {
            job_id: None,
            event,
        }
    }

    pub fn for_job(job_id: JobId, event: StatusEvent) -> Self {
        Self {
            job_id: Some(job_id),
            event,
        }
    }
}

/// Next phase for `event` applied in `phase`, or `None` if the event does not apply.
///
/// From `Idle`, progress and queue events pick up a job that was already running
/// when the session mounted.
pub fn transition(phase: &JobPhase, event: &StatusEvent, now: DateTime<Utc>) -> Option<JobPhase> {
    use StatusEvent as E;

    let next = match (phase, event) {
        (JobPhase::Idle | JobPhase::Exporting(_) | JobPhase::QueuedAt(_), E::Exporting(p)) => {
            JobPhase::Exporting(Progress::clamped(p.total, p.processed))
        }
        (JobPhase::Idle | JobPhase::Exporting(_) | JobPhase::QueuedAt(_), E::Queued { position }) => {
            JobPhase::QueuedAt(*position)
        }
        (JobPhase::Exporting(_), E::ExportDone) => JobPhase::Importing(Progress::default()),
        (JobPhase::Idle | JobPhase::Importing(_), E::Importing(p)) => {
            JobPhase::Importing(Progress::clamped(p.total, p.processed))
        }
        (JobPhase::Importing(_), E::ImportDone { completed_at }) => {
            JobPhase::Done(completed_at.unwrap_or(now))
        }
        (p, E::Failed { reason }) if !p.is_terminal() => JobPhase::Failed(reason.clone()),
        _ => return None,
    };

    Some(next)
}

/// Read-only view of the machine handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub phase: JobPhase,
    pub job_id: Option<JobId>,
}

impl JobState {
    pub fn idle() -> Self {
        Self {
            phase: JobPhase::Idle,
            job_id: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.phase.is_busy()
    }

    /// Phase allows a new job to be started (selection and directory checks live
    /// in the orchestrator).
    pub fn is_startable(&self) -> bool {
        !self.is_busy()
    }

    /// Progress for display. `None` outside exporting/importing.
    pub fn display_progress(&self) -> Option<(Stage, Progress)> {
        match self.phase {
            JobPhase::Exporting(p) => Some((Stage::Exporting, p)),
            JobPhase::Importing(p) => Some((Stage::Importing, p)),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("a copy job is already in progress")]
    Busy,
    #[error("session has been unmounted")]
    Disposed,
}

/// Owner of the job state for one mounted session.
pub struct JobStatusMachine {
    state: Mutex<JobState>,
    tx: watch::Sender<JobState>,
    disposed: AtomicBool,
}

impl Default for JobStatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStatusMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(JobState::idle());
        Self {
            state: Mutex::new(JobState::idle()),
            tx,
            disposed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> JobState {
        self.lock().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().is_busy()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop accepting mutations. Anything delivered afterwards is dropped.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Enter `Exporting(0,0)` for a new job. Returns the state before the reset so
    /// the caller can roll back if the server never accepts the job.
    pub fn start(&self, job_id: JobId) -> Result<JobState, StartError> {
        let mut state = self.lock();
        if self.is_disposed() {
            return Err(StartError::Disposed);
        }
        if state.is_busy() {
            return Err(StartError::Busy);
        }

        let previous = state.clone();
        *state = JobState {
            phase: JobPhase::Exporting(Progress::default()),
            job_id: Some(job_id),
        };
        self.tx.send_replace(state.clone());
        info!(job_id = %job_id, from = previous.phase.name(), "Copy job started");

        Ok(previous)
    }

    /// Restore `previous` if `job_id` is still the current job. Returns whether
    /// the rollback happened.
    pub fn rollback(&self, job_id: JobId, previous: JobState) -> bool {
        let mut state = self.lock();
        if self.is_disposed() || state.job_id != Some(job_id) {
            return false;
        }

        debug!(job_id = %job_id, to = previous.phase.name(), "Rolling back job start");
        *state = previous;
        self.tx.send_replace(state.clone());
        true
    }

    /// Apply a status event. Returns the new phase when the state changed.
    pub fn apply(&self, envelope: &StatusEnvelope) -> Option<JobPhase> {
        let mut state = self.lock();
        if self.is_disposed() {
            debug!(event = envelope.event.name(), "Dropping event after unmount");
            return None;
        }

        if let (Some(incoming), Some(current)) = (envelope.job_id, state.job_id) {
            if incoming != current {
                debug!(
                    event = envelope.event.name(),
                    job_id = %incoming,
                    current = %current,
                    "Ignoring event for another job"
                );
                return None;
            }
        }

        let Some(next) = transition(&state.phase, &envelope.event, Utc::now()) else {
            debug!(
                phase = state.phase.name(),
                event = envelope.event.name(),
                "Ignoring event with no transition"
            );
            return None;
        };

        if next == state.phase {
            return None;
        }

        if state.phase == JobPhase::Idle {
            state.job_id = envelope.job_id;
            info!(phase = next.name(), "Observing copy job already in progress");
        }

        if next.is_terminal() {
            info!(phase = next.name(), "Copy job finished");
        }
        state.phase = next.clone();
        self.tx.send_replace(state.clone());
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn progress(total: u64, processed: u64) -> Progress {
        Progress { total, processed }
    }

    fn all_phases() -> Vec<JobPhase> {
        vec![
            JobPhase::Idle,
            JobPhase::Exporting(progress(10, 4)),
            JobPhase::QueuedAt(2),
            JobPhase::Importing(progress(10, 4)),
            JobPhase::Done(at()),
            JobPhase::Failed("boom".to_string()),
        ]
    }

    fn all_events() -> Vec<StatusEvent> {
        vec![
            StatusEvent::Queued { position: 1 },
            StatusEvent::Exporting(progress(20, 5)),
            StatusEvent::ExportDone,
            StatusEvent::Importing(progress(20, 5)),
            StatusEvent::ImportDone { completed_at: None },
            StatusEvent::Failed {
                reason: "server timeout".to_string(),
            },
        ]
    }

    fn expected(phase: &JobPhase, event: &StatusEvent) -> Option<JobPhase> {
        use StatusEvent as E;
        match (phase, event) {
            (JobPhase::Idle, E::Queued { .. }) => Some(JobPhase::QueuedAt(1)),
            (JobPhase::Idle, E::Exporting(_)) => Some(JobPhase::Exporting(progress(20, 5))),
            (JobPhase::Idle, E::Importing(_)) => Some(JobPhase::Importing(progress(20, 5))),
            (JobPhase::Exporting(_), E::Exporting(_)) => Some(JobPhase::Exporting(progress(20, 5))),
            (JobPhase::Exporting(_), E::Queued { .. }) => Some(JobPhase::QueuedAt(1)),
            (JobPhase::Exporting(_), E::ExportDone) => Some(JobPhase::Importing(progress(0, 0))),
            (JobPhase::QueuedAt(_), E::Queued { .. }) => Some(JobPhase::QueuedAt(1)),
            (JobPhase::QueuedAt(_), E::Exporting(_)) => Some(JobPhase::Exporting(progress(20, 5))),
            (JobPhase::Importing(_), E::Importing(_)) => Some(JobPhase::Importing(progress(20, 5))),
            (JobPhase::Importing(_), E::ImportDone { .. }) => Some(JobPhase::Done(at())),
            (
                JobPhase::Idle | JobPhase::Exporting(_) | JobPhase::QueuedAt(_) | JobPhase::Importing(_),
                E::Failed { .. },
            ) => Some(JobPhase::Failed("server timeout".to_string())),
            _ => None,
        }
    }

    #[test]
    fn test_transition_table_is_exhaustive() {
        for phase in all_phases() {
            for event in all_events() {
                assert_eq!(
                    transition(&phase, &event, at()),
                    expected(&phase, &event),
                    "phase {:?} event {:?}",
                    phase,
                    event
                );
            }
        }
    }

    #[test]
    fn test_progress_clamp() {
        for (total, processed) in [(0, 1), (10, 11), (100, 250), (1, u64::MAX)] {
            let next = transition(
                &JobPhase::Exporting(Progress::default()),
                &StatusEvent::Exporting(progress(total, processed)),
                at(),
            );
            assert_eq!(next, Some(JobPhase::Exporting(progress(total, total))));

            let next = transition(
                &JobPhase::Importing(Progress::default()),
                &StatusEvent::Importing(progress(total, processed)),
                at(),
            );
            assert_eq!(next, Some(JobPhase::Importing(progress(total, total))));
        }
    }

    #[test]
    fn test_duplicate_events_are_idempotent() {
        for phase in all_phases().into_iter().filter(|p| !p.is_terminal()) {
            for event in all_events() {
                let once = transition(&phase, &event, at()).unwrap_or_else(|| phase.clone());
                let twice = transition(&once, &event, at()).unwrap_or_else(|| once.clone());
                assert_eq!(once, twice, "phase {:?} event {:?}", phase, event);
            }
        }
    }

    #[test]
    fn test_import_done_uses_server_date() {
        let server_date = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let next = transition(
            &JobPhase::Importing(progress(3, 3)),
            &StatusEvent::ImportDone {
                completed_at: Some(server_date),
            },
            at(),
        );
        assert_eq!(next, Some(JobPhase::Done(server_date)));
    }

    #[test]
    fn test_scenario_start_then_progress() {
        let machine = JobStatusMachine::new();
        let job_id = JobId::new();

        let previous = machine.start(job_id).unwrap();
        assert_eq!(previous, JobState::idle());
        assert_eq!(machine.state().phase, JobPhase::Exporting(progress(0, 0)));

        machine.apply(&StatusEnvelope::new(StatusEvent::Exporting(progress(100, 40))));
        assert_eq!(machine.state().phase, JobPhase::Exporting(progress(100, 40)));
    }

    #[test]
    fn test_scenario_export_import_done() {
        let machine = JobStatusMachine::new();
        machine.start(JobId::new()).unwrap();
        machine.apply(&StatusEnvelope::new(StatusEvent::Exporting(progress(100, 100))));

        machine.apply(&StatusEnvelope::new(StatusEvent::ExportDone));
        assert_eq!(machine.state().phase, JobPhase::Importing(progress(0, 0)));

        machine.apply(&StatusEnvelope::new(StatusEvent::Importing(progress(100, 100))));
        machine.apply(&StatusEnvelope::new(StatusEvent::ImportDone { completed_at: None }));
        assert!(matches!(machine.state().phase, JobPhase::Done(_)));
        assert!(!machine.is_busy());
    }

    #[test]
    fn test_scenario_duplicate_queue_position() {
        let machine = JobStatusMachine::new();
        machine.start(JobId::new()).unwrap();
        machine.apply(&StatusEnvelope::new(StatusEvent::Queued { position: 3 }));
        assert_eq!(machine.state().phase, JobPhase::QueuedAt(3));

        machine.apply(&StatusEnvelope::new(StatusEvent::Queued { position: 1 }));
        let changed = machine.apply(&StatusEnvelope::new(StatusEvent::Queued { position: 1 }));
        assert!(changed.is_none());
        assert_eq!(machine.state().phase, JobPhase::QueuedAt(1));
    }

    #[test]
    fn test_idle_ignores_completion_events() {
        let machine = JobStatusMachine::new();
        assert!(machine.apply(&StatusEnvelope::new(StatusEvent::ExportDone)).is_none());
        assert!(
            machine
                .apply(&StatusEnvelope::new(StatusEvent::ImportDone { completed_at: None }))
                .is_none()
        );
        assert_eq!(machine.state(), JobState::idle());
    }

    #[test]
    fn test_idle_observes_running_job() {
        let machine = JobStatusMachine::new();
        let running = JobId::new();

        let next = machine.apply(&StatusEnvelope::for_job(running, StatusEvent::Queued { position: 2 }));
        assert_eq!(next, Some(JobPhase::QueuedAt(2)));
        assert_eq!(machine.state().job_id, Some(running));
        assert!(machine.is_busy());

        let other = StatusEnvelope::for_job(JobId::new(), StatusEvent::Exporting(progress(9, 0)));
        assert!(machine.apply(&other).is_none());

        machine.apply(&StatusEnvelope::for_job(running, StatusEvent::Exporting(progress(10, 0))));
        machine.apply(&StatusEnvelope::for_job(running, StatusEvent::ExportDone));
        machine.apply(&StatusEnvelope::for_job(running, StatusEvent::ImportDone { completed_at: None }));
        assert!(matches!(machine.state().phase, JobPhase::Done(_)));
    }

    #[test]
    fn test_idle_accepts_failure() {
        let machine = JobStatusMachine::new();
        let next = machine.apply(&StatusEnvelope::new(StatusEvent::Failed {
            reason: "quota".to_string(),
        }));
        assert_eq!(next, Some(JobPhase::Failed("quota".to_string())));
        assert!(machine.state().job_id.is_none());
        assert!(machine.start(JobId::new()).is_ok());
    }

    #[test]
    fn test_start_refused_while_busy() {
        let machine = JobStatusMachine::new();
        machine.start(JobId::new()).unwrap();
        machine.apply(&StatusEnvelope::new(StatusEvent::Queued { position: 2 }));

        let before = machine.state();
        assert_eq!(machine.start(JobId::new()), Err(StartError::Busy));
        assert_eq!(machine.state(), before);
    }

    #[test]
    fn test_restart_after_failure() {
        let machine = JobStatusMachine::new();
        machine.start(JobId::new()).unwrap();
        machine.apply(&StatusEnvelope::new(StatusEvent::Failed {
            reason: "quota".to_string(),
        }));
        assert_eq!(machine.state().phase, JobPhase::Failed("quota".to_string()));

        let second = JobId::new();
        machine.start(second).unwrap();
        assert_eq!(machine.state().phase, JobPhase::Exporting(progress(0, 0)));
        assert_eq!(machine.state().job_id, Some(second));
    }

    #[test]
    fn test_events_for_other_job_are_ignored() {
        let machine = JobStatusMachine::new();
        let current = JobId::new();
        machine.start(current).unwrap();

        let stale = StatusEnvelope::for_job(JobId::new(), StatusEvent::ExportDone);
        assert!(machine.apply(&stale).is_none());

        let live = StatusEnvelope::for_job(current, StatusEvent::ExportDone);
        assert_eq!(
            machine.apply(&live),
            Some(JobPhase::Importing(progress(0, 0)))
        );
    }

    #[test]
    fn test_rollback_restores_previous_state() {
        let machine = JobStatusMachine::new();
        let job_id = JobId::new();
        let previous = machine.start(job_id).unwrap();

        assert!(machine.rollback(job_id, previous));
        assert_eq!(machine.state(), JobState::idle());
        assert!(!machine.rollback(JobId::new(), JobState::idle()));
    }

    #[test]
    fn test_disposed_machine_ignores_everything() {
        let machine = JobStatusMachine::new();
        machine.start(JobId::new()).unwrap();
        let mut rx = machine.subscribe();
        rx.mark_unchanged();

        machine.dispose();
        assert!(machine.apply(&StatusEnvelope::new(StatusEvent::ExportDone)).is_none());
        assert_eq!(machine.start(JobId::new()), Err(StartError::Disposed));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(machine.state().phase, JobPhase::Exporting(progress(0, 0)));
    }

    #[test]
    fn test_display_progress_only_while_transferring() {
        let mut state = JobState::idle();
        assert!(state.display_progress().is_none());

        state.phase = JobPhase::Importing(progress(5, 2));
        assert_eq!(
            state.display_progress(),
            Some((Stage::Importing, progress(5, 2)))
        );

        state.phase = JobPhase::QueuedAt(4);
        assert!(state.display_progress().is_none());
    }
}
