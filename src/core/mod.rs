pub mod directory;
pub mod machine;
pub mod models;
pub mod notifications;
pub mod orchestrator;

pub use directory::{DirectoryCache, DirectoryError, DirectorySource, StaticDirectory};
pub use machine::{JobPhase, JobState, JobStatusMachine, Progress, StatusEnvelope, StatusEvent};
pub use models::{CopyCommand, DestinationSelection, DirectoryEntry, JobId, JobIdentity};
pub use notifications::{JobReport, ResultNotifier};
pub use orchestrator::{
    AutoConfirm, ConfirmPrompt, Confirmer, CopyError, CopyOrchestrator, CopyOutcome,
    NotReadyReason,
};
