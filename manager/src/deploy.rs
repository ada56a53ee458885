// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent deployment and uninstall (spec §4.13).
//!
//! Rides the same SSH pool and SFTP reader the Spider Engine uses — this is
//! not a separate transport, just a different sequence of calls against it:
//! write a config file and a systemd unit, then `systemctl enable --now`.

use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use keyspider_core::error::{KeyspiderError, Result};
use keyspider_core::models::{AgentStatus, DeploymentStatus, Server};
use keyspider_core::persistence::PersistenceStore;
use keyspider_core::sftp;
use keyspider_core::ssh_pool::SshPool;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;

const INSTALL_DIR: &str = "/opt/keyspider";
const CONFIG_PATH: &str = "/opt/keyspider/config.json";
const UNIT_PATH: &str = "/etc/systemd/system/keyspider-agent.service";
const SERVICE_NAME: &str = "keyspider-agent";

pub struct AgentManager {
    pool: Arc<SshPool>,
    store: Arc<dyn PersistenceStore>,
    api_url: String,
}

impl AgentManager {
    pub fn new(pool: Arc<SshPool>, store: Arc<dyn PersistenceStore>, api_url: String) -> Self {
        AgentManager { pool, store, api_url }
    }

    /// Generate a fresh token, write the agent's config and systemd unit
    /// over SFTP, and enable+start the service. Idempotent: re-deploying an
    /// already-deployed host overwrites the token and restarts the unit.
    pub async fn deploy(&self, server: &Server, agent_version: &str) -> Result<String> {
        let token = generate_token();
        let token_hash = hash_token(&token);

        let guard = self
            .pool
            .acquire(&server.ip_address, server.ssh_port)
            .await
            .map_err(|e| KeyspiderError::Connect(e.to_string()))?;

        let config_body = serde_json::json!({
            "api_url": self.api_url,
            "server_id": server.id,
            "agent_token": token,
            "heartbeat_interval": 60,
            "collect_interval": 30,
            "log_paths": default_log_paths(server.os_type),
            "agent_version": agent_version,
        });

        let result: Result<()> = async {
            let sftp = {
                let mut session = guard.session.lock().await;
                session
                    .open_sftp()
                    .await
                    .ok_or_else(|| KeyspiderError::Protocol("failed to open sftp subsystem".into()))?
            };

            sftp::mkdir(&sftp, INSTALL_DIR).await?;
            sftp::write(&sftp, CONFIG_PATH, config_body.to_string().as_bytes()).await?;
            sftp::write(&sftp, UNIT_PATH, systemd_unit().as_bytes()).await?;

            let mut session = guard.session.lock().await;
            let (status, output) = session
                .exec("systemctl daemon-reload && systemctl enable --now keyspider-agent")
                .await
                .ok_or_else(|| KeyspiderError::Protocol("systemctl command channel failed".into()))?;
            if status != 0 {
                return Err(KeyspiderError::Protocol(format!(
                    "systemctl enable --now failed (status {status}): {output}"
                )));
            }
            Ok(())
        }
        .await;

        self.pool.release(guard).await;
        result?;

        self.store
            .upsert_agent_status(AgentStatus {
                server_id: server.id,
                agent_version: Some(agent_version.to_string()),
                deployment_status: DeploymentStatus::Active,
                last_heartbeat_at: None,
                last_event_at: None,
                agent_token_hash: token_hash,
                config: config_body,
                installed_at: Some(Utc::now()),
                error_message: None,
            })
            .await?;

        info!(server_id = %server.id, "agent deployed");
        Ok(token)
    }

    /// Stop and disable the unit, remove the unit and install directory,
    /// reload systemd. Tolerant of a host where the service was never
    /// installed (every step no-ops on "not found").
    pub async fn uninstall(&self, server: &Server) -> Result<()> {
        let guard = self
            .pool
            .acquire(&server.ip_address, server.ssh_port)
            .await
            .map_err(|e| KeyspiderError::Connect(e.to_string()))?;

        let result: Result<()> = async {
            {
                let mut session = guard.session.lock().await;
                // `|| true`: neither command's failure (service already
                // stopped/disabled) should abort the uninstall.
                session
                    .exec(&format!("systemctl stop {SERVICE_NAME} || true; systemctl disable {SERVICE_NAME} || true"))
                    .await
                    .ok_or_else(|| KeyspiderError::Protocol("systemctl stop/disable channel failed".into()))?;
            }

            let sftp = {
                let mut session = guard.session.lock().await;
                session
                    .open_sftp()
                    .await
                    .ok_or_else(|| KeyspiderError::Protocol("failed to open sftp subsystem".into()))?
            };
            sftp::remove_file(&sftp, UNIT_PATH).await?;
            sftp::remove_file(&sftp, CONFIG_PATH).await?;
            sftp::remove_dir(&sftp, INSTALL_DIR).await?;

            let mut session = guard.session.lock().await;
            session
                .exec("systemctl daemon-reload")
                .await
                .ok_or_else(|| KeyspiderError::Protocol("systemctl daemon-reload channel failed".into()))?;
            Ok(())
        }
        .await;

        self.pool.release(guard).await;
        result?;

        if let Some(mut status) = self.store.get_agent_status(server.id).await? {
            status.deployment_status = DeploymentStatus::NotDeployed;
            status.error_message = None;
            self.store.upsert_agent_status(status).await?;
        }

        info!(server_id = %server.id, "agent uninstalled");
        Ok(())
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn default_log_paths(os_type: keyspider_core::models::OsType) -> Vec<&'static str> {
    use keyspider_core::models::OsType;
    match os_type {
        OsType::Linux => vec!["/var/log/auth.log", "/var/log/secure"],
        OsType::Aix => vec!["/var/adm/syslog", "/var/log/syslog"],
    }
}

fn systemd_unit() -> String {
    format!(
        "[Unit]\n\
         Description=Keyspider access-graph collector\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart=/opt/keyspider/keyspider-agent\n\
         WorkingDirectory={INSTALL_DIR}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_32_bytes_url_safe_no_padding() {
        let token = generate_token();
        assert!(!token.contains('='));
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&token).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn hash_token_is_stable_sha256_hex() {
        let h1 = hash_token("abc");
        let h2 = hash_token("abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_token("abd"));
    }

    #[test]
    fn log_paths_differ_by_os() {
        use keyspider_core::models::OsType;
        assert!(default_log_paths(OsType::Linux).contains(&"/var/log/auth.log"));
        assert!(default_log_paths(OsType::Aix).contains(&"/var/adm/syslog"));
    }
}
