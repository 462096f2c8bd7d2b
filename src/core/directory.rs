//! Destination workspace/environment lookup.
//!
//! The cache is filled once per session. A failed lookup keeps whatever was
//! loaded before and flags the cache as unavailable until a later lookup succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::models::{DirectoryEntry, EnvironmentEntry};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("workspace not found: {0}")]
    NotFound(String),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Outbound lookups against the workspace directory.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    async fn workspaces(&self) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    async fn environments(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<EnvironmentEntry>, DirectoryError>;
}

pub struct DirectoryCache {
    source: Arc<dyn DirectorySource>,
    source_workspace_id: String,
    entries: Vec<DirectoryEntry>,
    unavailable: Option<String>,
}

impl DirectoryCache {
    /// `source_workspace_id` is never offered as a destination.
    pub fn new(source: Arc<dyn DirectorySource>, source_workspace_id: impl Into<String>) -> Self {
        Self {
            source,
            source_workspace_id: source_workspace_id.into(),
            entries: Vec::new(),
            unavailable: None,
        }
    }

    /// Reload the workspace list.
    pub async fn refresh(&mut self) -> Result<(), DirectoryError> {
        match self.source.workspaces().await {
            Ok(entries) => {
                self.entries = entries
                    .into_iter()
                    .filter(|entry| entry.id != self.source_workspace_id)
                    .collect();
                self.unavailable = None;
                debug!(count = self.entries.len(), "Workspace directory loaded");
                Ok(())
            }
            Err(e) => Err(self.mark_unavailable(e)),
        }
    }

    /// Destination workspaces, never including the source workspace.
    pub fn list_workspaces(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn workspace(&self, workspace_id: &str) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|entry| entry.id == workspace_id)
    }

    /// Look up the environments of a destination workspace and cache them on its entry.
    pub async fn list_environments(
        &mut self,
        workspace_id: &str,
    ) -> Result<Vec<EnvironmentEntry>, DirectoryError> {
        if self.workspace(workspace_id).is_none() {
            return Err(DirectoryError::NotFound(workspace_id.to_string()));
        }

        match self.source.environments(workspace_id).await {
            Ok(environments) => {
                self.unavailable = None;
                if let Some(entry) = self.entries.iter_mut().find(|e| e.id == workspace_id) {
                    entry.environments = environments.clone();
                }
                Ok(environments)
            }
            Err(DirectoryError::NotFound(id)) => Err(DirectoryError::NotFound(id)),
            Err(e) => Err(self.mark_unavailable(e)),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.is_some()
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        self.unavailable.as_deref()
    }

    fn mark_unavailable(&mut self, error: DirectoryError) -> DirectoryError {
        let reason = match &error {
            DirectoryError::Unavailable(reason) => reason.clone(),
            other => other.to_string(),
        };
        warn!(error = %reason, "Directory lookup failed, keeping cached entries");
        self.unavailable = Some(reason.clone());
        DirectoryError::Unavailable(reason)
    }
}

/// In-memory directory used by simulation mode and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    workspaces: Vec<DirectoryEntry>,
    environments: HashMap<String, Vec<EnvironmentEntry>>,
}

impl StaticDirectory {
    pub fn new(workspaces: Vec<DirectoryEntry>) -> Self {
        let environments = workspaces
            .iter()
            .map(|entry| (entry.id.clone(), entry.environments.clone()))
            .collect();
        Self {
            workspaces,
            environments,
        }
    }

    /// A small fixed directory for `--simulation` runs.
    pub fn sample() -> Self {
        let env = |id: &str| EnvironmentEntry {
            id: id.to_string(),
            name: id.to_string(),
        };
        Self::new(vec![
            DirectoryEntry {
                id: "marketing".to_string(),
                name: "Marketing Site".to_string(),
                environments: vec![env("master"), env("staging")],
            },
            DirectoryEntry {
                id: "docs".to_string(),
                name: "Documentation".to_string(),
                environments: vec![env("master")],
            },
        ])
    }
}

#[async_trait]
impl DirectorySource for StaticDirectory {
    async fn workspaces(&self) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        Ok(self
            .workspaces
            .iter()
            .map(|entry| DirectoryEntry {
                environments: Vec::new(),
                ..entry.clone()
            })
            .collect())
    }

    async fn environments(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<EnvironmentEntry>, DirectoryError> {
        self.environments
            .get(workspace_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(workspace_id.to_string()))
    }
}
