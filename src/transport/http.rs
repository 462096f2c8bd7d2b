//! HTTP plumbing for the copy service and the workspace directory.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, header};
use tracing::debug;

use super::{CommandAck, CommandError, TransportError};
use crate::core::directory::{DirectoryError, DirectorySource};
use crate::core::machine::Progress;
use crate::core::models::{CopyCommand, DirectoryEntry, EnvironmentEntry};

/// Client for the copy service endpoints.
///
/// Plain requests carry a per-request timeout. The event stream request does
/// not, since it stays open for the lifetime of the subscription.
pub struct HttpApi {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// `POST /copy-entry`
    pub async fn issue_command(&self, command: &CopyCommand) -> Result<CommandAck, CommandError> {
        let response = self
            .client
            .post(format!("{}/copy-entry", self.base_url))
            .timeout(self.timeout)
            .json(command)
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = response.status();
        debug!(job_id = %command.job_id, status = status.as_u16(), "Copy command answered");

        match status {
            s if s.is_success() => Ok(CommandAck {
                job_id: command.job_id,
            }),
            StatusCode::CONFLICT => Err(CommandError::JobAlreadyInFlight),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let body = response.text().await.unwrap_or_default();
                Err(CommandError::Rejected(body))
            }
            s => Err(TransportError::Status(s.as_u16()).into()),
        }
    }

    /// `GET /job-status/{recordId}`
    pub async fn job_status(&self, record_id: &str) -> Result<Progress, TransportError> {
        let response = self
            .client
            .get(format!("{}/job-status/{}", self.base_url, record_id))
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        response
            .json::<Progress>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// `GET /job-events/{recordId}` as a server-sent event stream.
    pub fn events_request(&self, record_id: &str) -> RequestBuilder {
        self.client
            .get(format!("{}/job-events/{}", self.base_url, record_id))
            .header(header::ACCEPT, "text/event-stream")
    }
}

/// Directory lookups over HTTP.
pub struct HttpDirectory {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, DirectoryError> {
        let unavailable = |e: reqwest::Error| DirectoryError::Unavailable(e.to_string());

        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response.json::<T>().await.map(Some).map_err(unavailable),
            s => Err(DirectoryError::Unavailable(format!(
                "directory responded with status {}",
                s.as_u16()
            ))),
        }
    }
}

#[async_trait]
impl DirectorySource for HttpDirectory {
    async fn workspaces(&self) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        self.get_json("/workspaces").await?.ok_or_else(|| {
            DirectoryError::Unavailable("workspace list not found at directory endpoint".to_string())
        })
    }

    async fn environments(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<EnvironmentEntry>, DirectoryError> {
        self.get_json(&format!("/workspaces/{}/environments", workspace_id))
            .await?
            .ok_or_else(|| DirectoryError::NotFound(workspace_id.to_string()))
    }
}
