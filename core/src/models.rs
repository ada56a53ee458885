// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The access-graph data model: servers, keys, their locations, observed
//! authentications, derived access paths, and unreachable sources.
//!
//! These types are the shapes the persistence trait (`crate::persistence`)
//! reads and writes. They carry no persistence-layer concerns of their own
//! (no row ids baked in beyond `id: Uuid`, no SQL).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Aix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveredVia {
    Manual,
    Scan,
    Import,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub hostname: String,
    pub ip_address: String,
    pub ssh_port: u16,
    pub os_type: OsType,
    pub os_version: Option<String>,
    pub is_reachable: bool,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub scan_watermark: Option<DateTime<Utc>>,
    pub last_log_size: Option<u64>,
    pub prefer_agent: bool,
    pub discovered_via: DiscoveredVia,
}

impl Server {
    /// The uniqueness key for a server: `(ip_address, ssh_port)`.
    pub fn key(ip_address: &str, ssh_port: u16) -> (String, u16) {
        (ip_address.to_string(), ssh_port)
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.hostname, self.ssh_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ed25519,
    Ecdsa,
    Dsa,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    pub id: Uuid,
    pub fingerprint_sha256: String,
    pub fingerprint_md5: Option<String>,
    pub key_type: KeyType,
    pub key_bits: Option<u32>,
    pub public_key_data: String,
    pub comment: Option<String>,
    pub is_host_key: bool,
    pub first_seen_at: DateTime<Utc>,
    pub file_mtime: Option<DateTime<Utc>>,
    pub estimated_age_days: Option<i64>,
}

impl SshKey {
    /// Recompute `estimated_age_days` from `file_mtime` relative to `now`.
    /// `file_mtime` is the oldest observed mtime across all locations, so
    /// this value only grows as a key ages, never resets on rediscovery.
    pub fn recompute_age(&mut self, now: DateTime<Utc>) {
        if let Some(mtime) = self.file_mtime {
            self.estimated_age_days = Some((now - mtime).num_days().max(0));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    AuthorizedKeys,
    PublicKey,
    PrivateKey,
    HostKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphLayer {
    Authorization,
    Usage,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLocation {
    pub ssh_key_id: Uuid,
    pub server_id: Uuid,
    pub file_path: String,
    pub file_type: FileType,
    pub unix_owner: Option<String>,
    pub unix_permissions: Option<u32>,
    pub graph_layer: GraphLayer,
    pub file_mtime: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

impl KeyLocation {
    /// The initial graph layer for a freshly discovered location: per
    /// invariant, only `authorized_keys` starts in `Authorization`; the
    /// reconciler is the only thing that ever promotes it to `Both`. All
    /// other file types also start `Authorization` (§9 open question —
    /// see DESIGN.md) rather than `Usage`, since nothing observes usage
    /// through a bare public-key or host-key file.
    pub fn initial_layer(_file_type: FileType) -> GraphLayer {
        GraphLayer::Authorization
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Accepted,
    Failed,
    InvalidUser,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    PublicKey,
    Password,
    KeyboardInteractive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Spider,
    Agent,
    Watcher,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub id: Uuid,
    pub target_server_id: Uuid,
    pub source_ip: String,
    pub source_server_id: Option<Uuid>,
    pub ssh_key_id: Option<Uuid>,
    pub fingerprint: Option<String>,
    pub username: String,
    pub auth_method: Option<AuthMethod>,
    pub event_type: EventType,
    pub event_time: DateTime<Utc>,
    pub raw_log_line: String,
    pub log_source: LogSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPath {
    pub id: Uuid,
    pub source_server_id: Option<Uuid>,
    pub target_server_id: Uuid,
    pub ssh_key_id: Option<Uuid>,
    pub username: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub event_count: u64,
    pub is_active: bool,
    pub is_authorized: bool,
    pub is_used: bool,
}

impl AccessPath {
    /// The four-tuple identity of a path. `NULL`s (represented here as
    /// `None`) are distinct per the spec's uniqueness rule, so two paths
    /// with different `source_server_id = None` origins but otherwise
    /// identical keys are different rows — callers must not collapse them.
    pub fn key(&self) -> (Option<Uuid>, Uuid, Option<Uuid>, String) {
        (
            self.source_server_id,
            self.target_server_id,
            self.ssh_key_id,
            self.username.clone(),
        )
    }

    pub fn is_dormant(&self) -> bool {
        self.is_authorized && !self.is_used
    }

    pub fn is_mystery(&self) -> bool {
        self.is_used && !self.is_authorized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreachableSource {
    pub id: Uuid,
    pub source_ip: String,
    pub reverse_dns: Option<String>,
    pub fingerprint: Option<String>,
    pub ssh_key_id: Option<Uuid>,
    pub target_server_id: Uuid,
    pub username: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub event_count: u64,
    pub severity: Severity,
    pub notes: Option<String>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    NotDeployed,
    Deploying,
    Active,
    Inactive,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub server_id: Uuid,
    pub agent_version: Option<String>,
    pub deployment_status: DeploymentStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub agent_token_hash: String,
    pub config: serde_json::Value,
    pub installed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl AgentStatus {
    /// The 5-minute freshness threshold from §4.9/§4.13's open question
    /// (duplicated in spirit in both call sites, consolidated here).
    pub const HEARTBEAT_FRESHNESS: chrono::Duration = chrono::Duration::seconds(300);

    pub fn is_heartbeat_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.last_heartbeat_at {
            Some(t) => now - t < Self::HEARTBEAT_FRESHNESS,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SudoEvent {
    pub id: Uuid,
    pub server_id: Uuid,
    pub username: String,
    pub command: Option<String>,
    pub target_user: Option<String>,
    pub working_dir: Option<String>,
    pub tty: Option<String>,
    pub event_time: DateTime<Utc>,
    pub success: bool,
    pub raw_log_line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanJobStatus {
    Queued,
    Running,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanJobTrigger {
    Manual,
    Scheduled,
    AgentEnrollment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub root_server_id: Uuid,
    pub max_depth: u32,
    pub trigger: ScanJobTrigger,
    pub status: ScanJobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchSessionStatus {
    Starting,
    Running,
    Backoff,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSession {
    pub id: Uuid,
    pub server_id: Uuid,
    pub status: WatchSessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_line_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_path_dormant_and_mystery_are_mutually_exclusive() {
        let mut p = AccessPath {
            id: Uuid::new_v4(),
            source_server_id: None,
            target_server_id: Uuid::new_v4(),
            ssh_key_id: None,
            username: "root".into(),
            first_seen_at: Utc::now(),
            last_seen_at: Utc::now(),
            event_count: 1,
            is_active: true,
            is_authorized: true,
            is_used: false,
        };
        assert!(p.is_dormant());
        assert!(!p.is_mystery());

        p.is_authorized = false;
        p.is_used = true;
        assert!(!p.is_dormant());
        assert!(p.is_mystery());
    }

    #[test]
    fn key_recompute_age_floors_at_zero() {
        let now = Utc::now();
        let mut key = SshKey {
            id: Uuid::new_v4(),
            fingerprint_sha256: "SHA256:abc".into(),
            fingerprint_md5: None,
            key_type: KeyType::Ed25519,
            key_bits: None,
            public_key_data: "AAAA".into(),
            comment: None,
            is_host_key: false,
            first_seen_at: now,
            file_mtime: Some(now + chrono::Duration::days(5)),
            estimated_age_days: None,
        };
        key.recompute_age(now);
        assert_eq!(key.estimated_age_days, Some(0));
    }

    #[test]
    fn agent_status_heartbeat_freshness() {
        let now = Utc::now();
        let fresh = AgentStatus {
            server_id: Uuid::new_v4(),
            agent_version: None,
            deployment_status: DeploymentStatus::Active,
            last_heartbeat_at: Some(now - chrono::Duration::seconds(120)),
            last_event_at: None,
            agent_token_hash: "x".into(),
            config: serde_json::json!({}),
            installed_at: None,
            error_message: None,
        };
        assert!(fresh.is_heartbeat_fresh(now));

        let stale = AgentStatus {
            last_heartbeat_at: Some(now - chrono::Duration::seconds(301)),
            ..fresh
        };
        assert!(!stale.is_heartbeat_fresh(now));
    }
}
