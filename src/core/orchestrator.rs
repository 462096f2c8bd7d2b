use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::directory::{DirectoryCache, DirectoryError};
use super::machine::{JobState, JobStatusMachine, StartError};
use super::models::{CopyCommand, DestinationSelection, EnvironmentEntry, JobId, JobIdentity};
use super::notifications::{JobReport, ResultNotifier};
use crate::transport::{CommandError, TransportChannel, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotReadyReason {
    #[error("a copy job is in progress")]
    Busy,
    #[error("destination workspace and environment must both be selected")]
    IncompleteDestination,
    #[error("workspace directory is unavailable")]
    DirectoryUnavailable,
    #[error("destination is the source workspace")]
    SameAsSource,
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("copy not possible: {0}")]
    NotReady(NotReadyReason),
    #[error("a copy job for this record is already in flight")]
    JobAlreadyInFlight,
    #[error("copy request rejected: {0}")]
    Rejected(String),
    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("destination is locked to the configured defaults")]
    DestinationLocked,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session has been unmounted")]
    Disposed,
}

impl From<DirectoryError> for CopyError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(id) => CopyError::NotFound(id),
            DirectoryError::Unavailable(reason) => CopyError::DirectoryUnavailable(reason),
        }
    }
}

impl From<CommandError> for CopyError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::JobAlreadyInFlight => CopyError::JobAlreadyInFlight,
            CommandError::Rejected(msg) => CopyError::Rejected(msg),
            CommandError::Transport(e) => CopyError::Transport(e),
        }
    }
}

/// Yes/no question put to the operator before a copy is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmPrompt {
    pub workspace_id: String,
    pub workspace_name: String,
    pub environment_id: String,
}

impl ConfirmPrompt {
    pub fn message(&self) -> String {
        format!(
            "Are you sure to copy the content to {} ({})?",
            self.workspace_name, self.environment_id
        )
    }
}

#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &ConfirmPrompt) -> bool;
}

/// Answers every prompt the same way. Used for `--yes` and in tests.
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, _prompt: &ConfirmPrompt) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Server accepted the job; progress follows on the status channel.
    Started(JobId),
    /// Operator answered "no". Nothing changed.
    Declined,
}

/// Checks preconditions, asks for confirmation and issues the copy command.
pub struct CopyOrchestrator {
    identity: JobIdentity,
    machine: Arc<JobStatusMachine>,
    transport: Arc<dyn TransportChannel>,
    directory: DirectoryCache,
    selection: DestinationSelection,
    confirmer: Arc<dyn Confirmer>,
    notifier: Arc<dyn ResultNotifier>,
    destination_locked: bool,
}

impl CopyOrchestrator {
    pub fn new(
        identity: JobIdentity,
        machine: Arc<JobStatusMachine>,
        transport: Arc<dyn TransportChannel>,
        directory: DirectoryCache,
        confirmer: Arc<dyn Confirmer>,
        notifier: Arc<dyn ResultNotifier>,
    ) -> Self {
        Self {
            identity,
            machine,
            transport,
            directory,
            selection: DestinationSelection::default(),
            confirmer,
            notifier,
            destination_locked: false,
        }
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    pub fn selection(&self) -> &DestinationSelection {
        &self.selection
    }

    pub fn directory(&self) -> &DirectoryCache {
        &self.directory
    }

    pub fn state(&self) -> JobState {
        self.machine.state()
    }

    /// Reload the destination directory. On failure the previous list stays.
    pub async fn load_directory(&mut self) -> Result<(), CopyError> {
        self.directory.refresh().await.map_err(CopyError::from)
    }

    /// Pre-select the configured destination. Unknown ids are skipped with a warning.
    pub async fn apply_defaults(
        &mut self,
        workspace_id: Option<&str>,
        environment_id: Option<&str>,
    ) {
        let Some(workspace_id) = workspace_id else {
            return;
        };
        if let Err(e) = self.change_workspace(workspace_id).await {
            warn!(workspace_id, error = %e, "Default workspace could not be selected");
            return;
        }
        if let Some(environment_id) = environment_id {
            if let Err(e) = self.change_environment(environment_id) {
                warn!(environment_id, error = %e, "Default environment could not be selected");
            }
        }
    }

    /// Pin the destination to whatever is currently selected.
    pub fn lock_destination(&mut self) {
        self.destination_locked = true;
    }

    pub async fn select_workspace(
        &mut self,
        workspace_id: &str,
    ) -> Result<Vec<EnvironmentEntry>, CopyError> {
        self.check_selection_allowed()?;
        self.change_workspace(workspace_id).await
    }

    pub fn select_environment(&mut self, environment_id: &str) -> Result<(), CopyError> {
        self.check_selection_allowed()?;
        self.change_environment(environment_id)
    }

    fn check_selection_allowed(&self) -> Result<(), CopyError> {
        if self.destination_locked {
            return Err(CopyError::DestinationLocked);
        }
        if self.machine.is_busy() {
            return Err(CopyError::NotReady(NotReadyReason::Busy));
        }
        Ok(())
    }

    async fn change_workspace(
        &mut self,
        workspace_id: &str,
    ) -> Result<Vec<EnvironmentEntry>, CopyError> {
        let lookup = self.directory.list_environments(workspace_id).await;

        let known = match &lookup {
            Ok(environments) => Some(environments.clone()),
            Err(DirectoryError::NotFound(_)) => None,
            Err(DirectoryError::Unavailable(_)) => self
                .directory
                .workspace(workspace_id)
                .map(|entry| entry.environments.clone()),
        };

        match known {
            Some(environments) => {
                self.selection.workspace_id = workspace_id.to_string();
                if !environments
                    .iter()
                    .any(|env| env.id == self.selection.environment_id)
                {
                    self.selection.environment_id.clear();
                }
            }
            None => self.selection = DestinationSelection::default(),
        }

        debug!(
            workspace_id = %self.selection.workspace_id,
            environment_id = %self.selection.environment_id,
            "Destination workspace changed"
        );
        lookup.map_err(CopyError::from)
    }

    fn change_environment(&mut self, environment_id: &str) -> Result<(), CopyError> {
        let exists = self
            .directory
            .workspace(&self.selection.workspace_id)
            .is_some_and(|entry| entry.environments.iter().any(|env| env.id == environment_id));

        if !exists {
            return Err(CopyError::NotFound(environment_id.to_string()));
        }

        self.selection.environment_id = environment_id.to_string();
        Ok(())
    }

    /// Why a copy cannot start right now, if anything.
    pub fn readiness(&self) -> Result<(), NotReadyReason> {
        if !self.machine.state().is_startable() {
            return Err(NotReadyReason::Busy);
        }
        if !self.selection.is_complete() {
            return Err(NotReadyReason::IncompleteDestination);
        }
        if self.selection.targets_source(&self.identity) {
            return Err(NotReadyReason::SameAsSource);
        }
        if self.directory.is_unavailable() {
            return Err(NotReadyReason::DirectoryUnavailable);
        }
        Ok(())
    }

    pub fn can_start(&self) -> bool {
        self.readiness().is_ok()
    }

    /// Confirm with the operator and issue the copy command.
    ///
    /// The machine is moved to `Exporting(0,0)` before the command is sent. If the
    /// server does not accept the job the previous state is restored, so a
    /// rejected request never leaves a phantom job on screen.
    pub async fn request_copy(&mut self) -> Result<CopyOutcome, CopyError> {
        self.readiness().map_err(CopyError::NotReady)?;

        let prompt = self.prompt();
        if !self.confirmer.confirm(&prompt).await {
            debug!("Copy declined by operator");
            return Ok(CopyOutcome::Declined);
        }

        let job_id = JobId::new();
        let previous = self.machine.start(job_id).map_err(|e| match e {
            StartError::Busy => CopyError::NotReady(NotReadyReason::Busy),
            StartError::Disposed => CopyError::Disposed,
        })?;

        let command = CopyCommand::new(job_id, &self.identity, &self.selection);
        match self.transport.issue_command(&command).await {
            Ok(ack) => {
                info!(
                    job_id = %ack.job_id,
                    record_id = %self.identity.record_id,
                    workspace_id = %self.selection.workspace_id,
                    environment_id = %self.selection.environment_id,
                    "Copy job accepted"
                );
                Ok(CopyOutcome::Started(ack.job_id))
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Copy command failed, rolling back");
                self.machine.rollback(job_id, previous);

                let error = CopyError::from(e);
                let report = JobReport::Failed {
                    record_id: self.identity.record_id.clone(),
                    reason: error.to_string(),
                };
                if let Err(e) = self.notifier.notify(report).await {
                    warn!(error = %e, "Failed to deliver result notification");
                }
                Err(error)
            }
        }
    }

    fn prompt(&self) -> ConfirmPrompt {
        let workspace_name = self
            .directory
            .workspace(&self.selection.workspace_id)
            .map_or_else(|| self.selection.workspace_id.clone(), |e| e.name.clone());
        ConfirmPrompt {
            workspace_id: self.selection.workspace_id.clone(),
            workspace_name,
            environment_id: self.selection.environment_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::directory::StaticDirectory;
    use crate::core::machine::{JobPhase, Progress, StatusEnvelope, StatusEvent};
    use crate::transport::simulated::{Rejection, SimulatedTransport, SimulatorHandle};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        reports: Mutex<Vec<JobReport>>,
    }

    #[async_trait]
    impl ResultNotifier for RecordingNotifier {
        async fn notify(&self, report: JobReport) -> anyhow::Result<()> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    struct PromptSpy {
        answer: bool,
        prompts: Mutex<Vec<ConfirmPrompt>>,
    }

    #[async_trait]
    impl Confirmer for PromptSpy {
        async fn confirm(&self, prompt: &ConfirmPrompt) -> bool {
            self.prompts.lock().unwrap().push(prompt.clone());
            self.answer
        }
    }

    struct Fixture {
        orchestrator: CopyOrchestrator,
        machine: Arc<JobStatusMachine>,
        handle: SimulatorHandle,
        notifier: Arc<RecordingNotifier>,
    }

    async fn fixture(confirmer: Arc<dyn Confirmer>) -> Fixture {
        let identity = JobIdentity::new("entry-1", "blog", "master");
        let machine = Arc::new(JobStatusMachine::new());
        let (transport, handle) = SimulatedTransport::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let directory = DirectoryCache::new(Arc::new(StaticDirectory::sample()), "blog");

        let mut orchestrator = CopyOrchestrator::new(
            identity,
            machine.clone(),
            Arc::new(transport),
            directory,
            confirmer,
            notifier.clone(),
        );
        orchestrator.load_directory().await.unwrap();

        Fixture {
            orchestrator,
            machine,
            handle,
            notifier,
        }
    }

    async fn ready_fixture() -> Fixture {
        let mut f = fixture(Arc::new(AutoConfirm(true))).await;
        f.orchestrator.select_workspace("marketing").await.unwrap();
        f.orchestrator.select_environment("staging").unwrap();
        f
    }

    #[tokio::test]
    async fn test_not_ready_without_destination() {
        let mut f = fixture(Arc::new(AutoConfirm(true))).await;
        let result = f.orchestrator.request_copy().await;
        assert!(matches!(
            result,
            Err(CopyError::NotReady(NotReadyReason::IncompleteDestination))
        ));
        assert!(f.handle.commands().is_empty());
    }

    #[tokio::test]
    async fn test_request_copy_issues_command() {
        let mut f = ready_fixture().await;
        assert!(f.orchestrator.can_start());

        let outcome = f.orchestrator.request_copy().await.unwrap();
        let CopyOutcome::Started(job_id) = outcome else {
            panic!("expected job to start");
        };

        let commands = f.handle.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].job_id, job_id);
        assert_eq!(commands[0].export.space_id, "blog");
        assert_eq!(commands[0].import.space_id, "marketing");
        assert_eq!(commands[0].import.environment_id, "staging");
        assert_eq!(
            f.machine.state().phase,
            JobPhase::Exporting(Progress::default())
        );
        assert_eq!(f.machine.state().job_id, Some(job_id));
    }

    #[tokio::test]
    async fn test_declined_confirmation_changes_nothing() {
        let spy = Arc::new(PromptSpy {
            answer: false,
            prompts: Mutex::new(Vec::new()),
        });
        let mut f = fixture(spy.clone()).await;
        f.orchestrator.select_workspace("marketing").await.unwrap();
        f.orchestrator.select_environment("master").unwrap();

        let outcome = f.orchestrator.request_copy().await.unwrap();
        assert_eq!(outcome, CopyOutcome::Declined);
        assert_eq!(f.machine.state(), JobState::idle());
        assert!(f.handle.commands().is_empty());

        let prompts = spy.prompts.lock().unwrap();
        assert_eq!(
            prompts[0].message(),
            "Are you sure to copy the content to Marketing Site (master)?"
        );
    }

    #[tokio::test]
    async fn test_busy_request_is_not_ready_and_leaves_state() {
        let mut f = ready_fixture().await;
        f.orchestrator.request_copy().await.unwrap();
        f.machine
            .apply(&StatusEnvelope::new(StatusEvent::Queued { position: 2 }));
        let before = f.machine.state();

        let result = f.orchestrator.request_copy().await;
        assert!(matches!(
            result,
            Err(CopyError::NotReady(NotReadyReason::Busy))
        ));
        assert_eq!(f.machine.state(), before);
        assert_eq!(f.handle.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_rolls_back_to_idle() {
        let mut f = ready_fixture().await;
        let before = f.machine.state();
        f.handle.reject_next(Rejection::InFlight);

        let result = f.orchestrator.request_copy().await;
        assert!(matches!(result, Err(CopyError::JobAlreadyInFlight)));
        assert_eq!(f.machine.state(), before);

        let reports = f.notifier.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].is_success());
    }

    #[tokio::test]
    async fn test_network_failure_rolls_back_to_previous_terminal_state() {
        let mut f = ready_fixture().await;
        let CopyOutcome::Started(first) = f.orchestrator.request_copy().await.unwrap() else {
            panic!("expected job to start");
        };
        f.handle
            .emit(
                "entry-1",
                StatusEnvelope::for_job(first, StatusEvent::Failed {
                    reason: "quota".to_string(),
                }),
            )
            .await;
        f.machine.apply(&StatusEnvelope::for_job(first, StatusEvent::Failed {
            reason: "quota".to_string(),
        }));
        let before = f.machine.state();
        assert_eq!(before.phase, JobPhase::Failed("quota".to_string()));

        f.handle.reject_next(Rejection::Unreachable);
        let result = f.orchestrator.request_copy().await;
        assert!(matches!(result, Err(CopyError::Transport(_))));
        assert_eq!(f.machine.state(), before);
    }

    #[tokio::test]
    async fn test_workspace_change_clears_unknown_environment() {
        let mut f = ready_fixture().await;
        assert_eq!(f.orchestrator.selection().environment_id, "staging");

        let envs = f.orchestrator.select_workspace("docs").await.unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(f.orchestrator.selection().workspace_id, "docs");
        assert!(f.orchestrator.selection().environment_id.is_empty());
        assert!(!f.orchestrator.can_start());
    }

    #[tokio::test]
    async fn test_source_workspace_cannot_be_selected() {
        let mut f = fixture(Arc::new(AutoConfirm(true))).await;
        let result = f.orchestrator.select_workspace("blog").await;
        assert!(matches!(result, Err(CopyError::NotFound(_))));
        assert_eq!(f.orchestrator.selection(), &DestinationSelection::default());
    }

    #[tokio::test]
    async fn test_selection_blocked_while_busy() {
        let mut f = ready_fixture().await;
        f.orchestrator.request_copy().await.unwrap();

        let result = f.orchestrator.select_workspace("docs").await;
        assert!(matches!(
            result,
            Err(CopyError::NotReady(NotReadyReason::Busy))
        ));
        assert_eq!(f.orchestrator.selection().workspace_id, "marketing");
    }

    #[tokio::test]
    async fn test_locked_destination_uses_defaults() {
        let mut f = fixture(Arc::new(AutoConfirm(true))).await;
        f.orchestrator
            .apply_defaults(Some("marketing"), Some("master"))
            .await;
        f.orchestrator.lock_destination();

        assert_eq!(f.orchestrator.selection().workspace_id, "marketing");
        assert_eq!(f.orchestrator.selection().environment_id, "master");
        assert!(matches!(
            f.orchestrator.select_environment("staging"),
            Err(CopyError::DestinationLocked)
        ));
        assert!(f.orchestrator.can_start());
    }
}
