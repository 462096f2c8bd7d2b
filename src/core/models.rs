use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The record being copied and where it lives. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIdentity {
    pub record_id: String,
    pub source_workspace_id: String,
    pub source_environment_id: String,
}

impl JobIdentity {
    pub fn new(
        record_id: impl Into<String>,
        source_workspace_id: impl Into<String>,
        source_environment_id: impl Into<String>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            source_workspace_id: source_workspace_id.into(),
            source_environment_id: source_environment_id.into(),
        }
    }
}

/// Destination chosen by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationSelection {
    pub workspace_id: String,
    pub environment_id: String,
}

impl DestinationSelection {
    pub fn is_complete(&self) -> bool {
        !self.workspace_id.is_empty() && !self.environment_id.is_empty()
    }

    /// True when the selection points back at the record's own workspace.
    pub fn targets_source(&self, identity: &JobIdentity) -> bool {
        self.workspace_id == identity.source_workspace_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    pub id: String,
    pub name: String,
}

/// A destination workspace as returned by the directory lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub environments: Vec<EnvironmentEntry>,
}

/// Correlation token attached to every command and, where the channel supports it,
/// every status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One side of a copy as the copy service expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordLocation {
    pub entry_id: String,
    pub space_id: String,
    pub environment_id: String,
}

/// Body of `POST /copy-entry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyCommand {
    pub job_id: JobId,
    pub export: RecordLocation,
    pub import: RecordLocation,
}

impl CopyCommand {
    pub fn new(job_id: JobId, identity: &JobIdentity, destination: &DestinationSelection) -> Self {
        Self {
            job_id,
            export: RecordLocation {
                entry_id: identity.record_id.clone(),
                space_id: identity.source_workspace_id.clone(),
                environment_id: identity.source_environment_id.clone(),
            },
            import: RecordLocation {
                entry_id: identity.record_id.clone(),
                space_id: destination.workspace_id.clone(),
                environment_id: destination.environment_id.clone(),
            },
        }
    }

    pub fn record_id(&self) -> &str {
        &self.export.entry_id
    }
}
