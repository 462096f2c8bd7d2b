//! Lifecycle of one mounted copy session.
//!
//! Mounting creates the state machine, loads the directory, subscribes to job
//! status for the record and starts the event pump. Unmounting marks the
//! machine disposed, cancels the subscription and stops the pump in one
//! synchronous call; anything still in flight is dropped by the disposed guard.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::core::directory::{DirectoryCache, DirectorySource, StaticDirectory};
use crate::core::machine::{JobState, JobStatusMachine, StatusEnvelope};
use crate::core::models::JobIdentity;
use crate::core::notifications::{self, JobReport, ResultNotifier};
use crate::core::orchestrator::{Confirmer, CopyError, CopyOrchestrator, CopyOutcome};
use crate::transport::simulated::JobScript;
use crate::transport::{self, HttpDirectory, SimulatedTransport, Subscription, TransportChannel};

const EVENT_BUFFER: usize = 64;

/// Collaborators a session is mounted with.
pub struct SessionDeps {
    pub transport: Arc<dyn TransportChannel>,
    pub directory: Arc<dyn DirectorySource>,
    pub confirmer: Arc<dyn Confirmer>,
    pub notifier: Arc<dyn ResultNotifier>,
}

impl SessionDeps {
    /// Real HTTP collaborators, or the simulated ones when `config.simulation` is set.
    pub fn from_config(config: &AppConfig, confirmer: Arc<dyn Confirmer>) -> Result<Self> {
        let notifier = notifications::create_notifier(config);

        if config.simulation {
            let (transport, _handle) = SimulatedTransport::scripted(JobScript::default());
            return Ok(Self {
                transport: Arc::new(transport),
                directory: Arc::new(StaticDirectory::sample()),
                confirmer,
                notifier,
            });
        }

        let transport =
            transport::create_channel(config).context("Failed to create status channel")?;
        let directory = HttpDirectory::new(config.directory_base_url(), config.request_timeout())
            .context("Failed to create directory client")?;

        Ok(Self {
            transport,
            directory: Arc::new(directory),
            confirmer,
            notifier,
        })
    }
}

pub struct CopySession {
    orchestrator: CopyOrchestrator,
    machine: Arc<JobStatusMachine>,
    subscription: Subscription,
    pump: Option<JoinHandle<()>>,
}

impl CopySession {
    /// Mount a session for `identity`. A directory failure is logged and leaves the
    /// session usable once the directory recovers.
    pub async fn mount(identity: JobIdentity, config: &AppConfig, deps: SessionDeps) -> Self {
        let machine = Arc::new(JobStatusMachine::new());
        let directory = DirectoryCache::new(deps.directory, identity.source_workspace_id.clone());

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let subscription = deps.transport.subscribe_to_status(&identity.record_id, tx);
        let pump = tokio::spawn(pump_events(
            machine.clone(),
            rx,
            deps.notifier.clone(),
            identity.record_id.clone(),
        ));

        let mut orchestrator = CopyOrchestrator::new(
            identity,
            machine.clone(),
            deps.transport,
            directory,
            deps.confirmer,
            deps.notifier,
        );

        if let Err(e) = orchestrator.load_directory().await {
            warn!(error = %e, "Workspace directory unavailable at mount");
        }
        orchestrator
            .apply_defaults(
                config.default_workspace_id.as_deref(),
                config.default_environment_id.as_deref(),
            )
            .await;
        if !config.allow_destination_override {
            orchestrator.lock_destination();
        }

        info!(record_id = %orchestrator.identity().record_id, "Copy session mounted");

        Self {
            orchestrator,
            machine,
            subscription,
            pump: Some(pump),
        }
    }

    /// Read-only view of the job state for rendering.
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.machine.subscribe()
    }

    pub fn state(&self) -> JobState {
        self.machine.state()
    }

    pub fn orchestrator(&self) -> &CopyOrchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut CopyOrchestrator {
        &mut self.orchestrator
    }

    pub async fn request_copy(&mut self) -> Result<CopyOutcome, CopyError> {
        if !self.is_mounted() {
            return Err(CopyError::Disposed);
        }
        self.orchestrator.request_copy().await
    }

    pub fn is_mounted(&self) -> bool {
        !self.machine.is_disposed()
    }

    /// Release the status subscription and stop applying events.
    pub fn unmount(&mut self) {
        if !self.is_mounted() {
            return;
        }
        self.machine.dispose();
        self.subscription.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        debug!(record_id = %self.orchestrator.identity().record_id, "Copy session unmounted");
    }
}

impl Drop for CopySession {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Apply events in arrival order and report terminal phases.
async fn pump_events(
    machine: Arc<JobStatusMachine>,
    mut events: mpsc::Receiver<StatusEnvelope>,
    notifier: Arc<dyn ResultNotifier>,
    record_id: String,
) {
    while let Some(envelope) = events.recv().await {
        if machine.is_disposed() {
            break;
        }

        let Some(phase) = machine.apply(&envelope) else {
            continue;
        };

        if let Some(report) = JobReport::from_phase(&record_id, &phase) {
            if let Err(e) = notifier.notify(report).await {
                warn!(record_id = %record_id, error = %e, "Failed to deliver result notification");
            }
        }
    }
}
