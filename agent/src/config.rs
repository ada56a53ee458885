// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent configuration.
//!
//! Despite spec §4.12 describing the agent's configuration as "injected at
//! deploy time", the shipped binary reads a local config file written by
//! the deploy step (`keyspider_manager::deploy::AgentManager::deploy`)
//! rather than having a literal `CONFIG = { ... }` block templated into its
//! source, since this agent is a compiled binary, not a script. The deploy
//! step writes the equivalent structured JSON file; this module reads it
//! back at startup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

/// Default location the deploy step writes the agent's config to.
pub const DEFAULT_CONFIG_PATH: &str = "/opt/keyspider/config.json";

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_collect_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub api_url: String,
    pub server_id: Uuid,
    pub agent_token: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_collect_interval")]
    pub collect_interval: u64,
    #[serde(default)]
    pub log_paths: Vec<String>,
    pub agent_version: String,
}

impl AgentConfig {
    /// Load from the config file at `path`, defaulting to
    /// [`DEFAULT_CONFIG_PATH`] or the `CONFIG_PATH` environment variable
    /// override (useful for running the agent outside its systemd unit).
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path: PathBuf = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };

        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read agent config at {}", path.display()))?;
        let config: AgentConfig = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse agent config at {}", path.display()))?;
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval)
    }

    pub fn collect_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.collect_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_config_with_defaults_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            r#"{
                "api_url": "https://manager.internal:8888",
                "server_id": "00000000-0000-0000-0000-000000000001",
                "agent_token": "sekrit",
                "agent_version": "1.0.0"
            }"#,
        )
        .await
        .unwrap();

        let config = AgentConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.heartbeat_interval, 60);
        assert_eq!(config.collect_interval, 30);
        assert_eq!(config.api_url, "https://manager.internal:8888");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let result = AgentConfig::load(Some(Path::new("/nonexistent/config.json"))).await;
        assert!(result.is_err());
    }
}
