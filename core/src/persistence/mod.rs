// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistence contract the core requires from a storage backend:
//! atomic get-or-create upserts, batch inserts, keyset lookups for the
//! spider's fingerprint→key and ip→server maps, a transactional commit
//! boundary per processed host, and a pagination helper.
//!
//! `MemoryStore` is the reference implementation used by tests;
//! `PostgresStore` is the production binding.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    AccessEvent, AccessPath, AgentStatus, KeyLocation, OsType, Server, SshKey, SudoEvent,
    UnreachableSource,
};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// The subset of `Server` fields supplied at creation time; everything
/// else takes its default (`is_reachable=false`, timestamps unset).
#[derive(Debug, Clone)]
pub struct ServerDefaults {
    pub hostname: String,
    pub os_type: OsType,
    pub discovered_via: crate::models::DiscoveredVia,
    pub prefer_agent: bool,
}

#[derive(Debug, Clone)]
pub struct SshKeyDefaults {
    pub fingerprint_md5: Option<String>,
    pub key_type: crate::models::KeyType,
    pub key_bits: Option<u32>,
    pub public_key_data: String,
    pub comment: Option<String>,
    pub is_host_key: bool,
    pub file_mtime: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
pub struct KeyLocationUpsert {
    pub ssh_key_id: Uuid,
    pub server_id: Uuid,
    pub file_path: String,
    pub file_type: crate::models::FileType,
    pub unix_owner: Option<String>,
    pub unix_permissions: Option<u32>,
    pub file_mtime: Option<chrono::DateTime<chrono::Utc>>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AccessPathUpsertKey {
    pub source_server_id: Option<Uuid>,
    pub target_server_id: Uuid,
    pub ssh_key_id: Option<Uuid>,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct UnreachableSourceUpsertKey {
    pub source_ip: String,
    pub target_server_id: Uuid,
    pub fingerprint: Option<String>,
    pub reverse_dns: Option<String>,
    pub username: Option<String>,
    pub severity: crate::models::Severity,
}

#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Reported by the reconciler after it runs inside a host's commit.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub locations_promoted: u64,
    pub paths_updated: u64,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn get_or_create_server(
        &self,
        ip_address: &str,
        ssh_port: u16,
        defaults: ServerDefaults,
    ) -> Result<(Server, bool)>;

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>>;

    async fn update_server_scan_state(
        &self,
        id: Uuid,
        last_scanned_at: chrono::DateTime<chrono::Utc>,
        is_reachable: bool,
        scan_watermark: Option<chrono::DateTime<chrono::Utc>>,
        last_log_size: Option<u64>,
    ) -> Result<()>;

    async fn list_servers(&self, page: PageQuery) -> Result<Page<Server>>;

    async fn get_or_create_ssh_key(
        &self,
        fingerprint_sha256: &str,
        defaults: SshKeyDefaults,
    ) -> Result<(SshKey, bool)>;

    /// Narrow the stored `file_mtime` to the minimum of its current value
    /// and `observed_mtime`, then recompute `estimated_age_days`.
    async fn narrow_key_mtime(
        &self,
        ssh_key_id: Uuid,
        observed_mtime: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()>;

    async fn keys_by_fingerprint(&self, fingerprints: &[String]) -> Result<HashMap<String, Uuid>>;

    async fn servers_by_ip(&self, ips: &[String]) -> Result<HashMap<String, Uuid>>;

    async fn upsert_key_location(&self, location: KeyLocationUpsert) -> Result<KeyLocation>;

    async fn key_locations_for_server(&self, server_id: Uuid) -> Result<Vec<KeyLocation>>;

    async fn insert_access_events(&self, events: &[AccessEvent]) -> Result<()>;

    async fn upsert_access_path(&self, key: AccessPathUpsertKey, event_time: chrono::DateTime<chrono::Utc>) -> Result<AccessPath>;

    async fn access_paths_for_target(&self, target_server_id: Uuid) -> Result<Vec<AccessPath>>;

    async fn access_paths_involving_server(&self, server_id: Uuid) -> Result<Vec<AccessPath>>;

    async fn access_paths_for_key(&self, ssh_key_id: Uuid) -> Result<Vec<AccessPath>>;

    async fn set_access_path_layers(&self, id: Uuid, is_authorized: bool, is_used: bool) -> Result<()>;

    async fn set_key_location_layer(&self, id: (Uuid, Uuid, String), layer: crate::models::GraphLayer) -> Result<()>;

    async fn upsert_unreachable_source(&self, key: UnreachableSourceUpsertKey, event_time: chrono::DateTime<chrono::Utc>) -> Result<UnreachableSource>;

    async fn list_unreachable_sources(&self, page: PageQuery) -> Result<Page<UnreachableSource>>;

    async fn get_agent_status(&self, server_id: Uuid) -> Result<Option<AgentStatus>>;

    async fn upsert_agent_status(&self, status: AgentStatus) -> Result<()>;

    async fn find_agent_by_token_hash(&self, token_hash: &str) -> Result<Option<AgentStatus>>;

    async fn mark_stale_agents_inactive(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<u64>;

    async fn insert_sudo_events(&self, events: &[SudoEvent]) -> Result<()>;

    async fn create_scan_job(&self, job: crate::models::ScanJob) -> Result<crate::models::ScanJob>;

    async fn update_scan_job_status(
        &self,
        id: Uuid,
        status: crate::models::ScanJobStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    async fn create_watch_session(&self, session: crate::models::WatchSession) -> Result<crate::models::WatchSession>;

    async fn update_watch_session_status(
        &self,
        id: Uuid,
        status: crate::models::WatchSessionStatus,
        last_line_at: Option<chrono::DateTime<chrono::Utc>>,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Run the per-host reconciler (§4.10) and commit it in the same
    /// transaction as the host's event+key writes. Implementations that
    /// have no real transaction boundary (the in-memory store) just run
    /// the computation directly — single-writer-per-host is still upheld
    /// by the spider calling this once per host scan.
    async fn reconcile_host(&self, server_id: Uuid) -> Result<ReconcileSummary>;
}
