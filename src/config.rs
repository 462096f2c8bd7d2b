//! Runtime configuration.
//!
//! Layered with `figment`: built-in defaults, then the TOML file, then
//! `RECORDCOPY_*` environment variables, then command-line flags.

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "recordcopy.toml";
pub const ENV_PREFIX: &str = "RECORDCOPY_";

/// How job status reaches the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StatusChannelKind {
    #[default]
    Poll,
    Push,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_endpoint: Option<String>,
    pub status_channel: StatusChannelKind,
    pub poll_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub request_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_workspace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_environment_id: Option<String>,
    /// When false the destination is pinned to the configured defaults.
    pub allow_destination_override: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            copy_endpoint: None,
            directory_endpoint: None,
            status_channel: StatusChannelKind::Poll,
            poll_interval_ms: 1500,
            reconnect_delay_ms: 2000,
            request_timeout_secs: 30,
            default_workspace_id: None,
            default_environment_id: None,
            allow_destination_override: true,
            webhook_url: None,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load and validate the configuration. `overrides` is usually the parsed CLI
    /// arguments, serialized with unset flags skipped.
    pub fn new<T: Serialize>(
        config_path: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let config: AppConfig = Self::figment(config_path, overrides)
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment<T: Serialize>(config_path: Option<&Path>, overrides: Option<&T>) -> Figment {
        let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !self.simulation && self.copy_endpoint.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Invalid(
                "copy_endpoint is required unless simulation is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Base URL for command and status requests, without a trailing slash.
    pub fn copy_base_url(&self) -> &str {
        self.copy_endpoint
            .as_deref()
            .unwrap_or_default()
            .trim_end_matches('/')
    }

    /// Base URL for directory lookups; falls back to the copy endpoint.
    pub fn directory_base_url(&self) -> &str {
        self.directory_endpoint
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or_else(|| self.copy_base_url())
    }
}
