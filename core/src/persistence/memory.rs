// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process reference implementation of `PersistenceStore`, used by
//! unit and integration tests and as the executable spec for the
//! Postgres-backed store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AccessPathUpsertKey, KeyLocationUpsert, Page, PageQuery, PersistenceStore, ReconcileSummary,
    ServerDefaults, SshKeyDefaults, UnreachableSourceUpsertKey,
};
use crate::error::{KeyspiderError, Result};
use crate::models::{
    AccessEvent, AccessPath, AgentStatus, DiscoveredVia, FileType, GraphLayer, KeyLocation,
    OsType, ScanJob, ScanJobStatus, Server, SshKey, SudoEvent, UnreachableSource, WatchSession,
    WatchSessionStatus,
};

#[derive(Default)]
struct Tables {
    servers: HashMap<Uuid, Server>,
    servers_by_key: HashMap<(String, u16), Uuid>,
    ssh_keys: HashMap<Uuid, SshKey>,
    ssh_keys_by_fingerprint: HashMap<String, Uuid>,
    key_locations: HashMap<(Uuid, Uuid, String), KeyLocation>,
    access_events: Vec<AccessEvent>,
    access_paths: HashMap<Uuid, AccessPath>,
    unreachable_sources: HashMap<(String, Uuid, Option<String>), UnreachableSource>,
    agent_statuses: HashMap<Uuid, AgentStatus>,
    sudo_events: Vec<SudoEvent>,
    scan_jobs: HashMap<Uuid, ScanJob>,
    watch_sessions: HashMap<Uuid, WatchSession>,
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: RwLock::new(Tables::default()),
        }
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn get_or_create_server(
        &self,
        ip_address: &str,
        ssh_port: u16,
        defaults: ServerDefaults,
    ) -> Result<(Server, bool)> {
        let mut tables = self.tables.write().await;
        let key = (ip_address.to_string(), ssh_port);
        if let Some(id) = tables.servers_by_key.get(&key) {
            return Ok((tables.servers[id].clone(), false));
        }

        let server = Server {
            id: Uuid::new_v4(),
            hostname: defaults.hostname,
            ip_address: ip_address.to_string(),
            ssh_port,
            os_type: defaults.os_type,
            os_version: None,
            is_reachable: false,
            last_scanned_at: None,
            scan_watermark: None,
            last_log_size: None,
            prefer_agent: defaults.prefer_agent,
            discovered_via: defaults.discovered_via,
        };
        tables.servers_by_key.insert(key, server.id);
        tables.servers.insert(server.id, server.clone());
        Ok((server, true))
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>> {
        Ok(self.tables.read().await.servers.get(&id).cloned())
    }

    async fn update_server_scan_state(
        &self,
        id: Uuid,
        last_scanned_at: chrono::DateTime<Utc>,
        is_reachable: bool,
        scan_watermark: Option<chrono::DateTime<Utc>>,
        last_log_size: Option<u64>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let server = tables
            .servers
            .get_mut(&id)
            .ok_or_else(|| KeyspiderError::NotFound(id.to_string()))?;
        server.last_scanned_at = Some(last_scanned_at);
        server.is_reachable = is_reachable;
        if scan_watermark.is_some() {
            server.scan_watermark = scan_watermark;
        }
        if last_log_size.is_some() {
            server.last_log_size = last_log_size;
        }
        Ok(())
    }

    async fn list_servers(&self, page: PageQuery) -> Result<Page<Server>> {
        let tables = self.tables.read().await;
        let mut all: Vec<Server> = tables.servers.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit.max(1) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn get_or_create_ssh_key(
        &self,
        fingerprint_sha256: &str,
        defaults: SshKeyDefaults,
    ) -> Result<(SshKey, bool)> {
        let mut tables = self.tables.write().await;
        if let Some(id) = tables.ssh_keys_by_fingerprint.get(fingerprint_sha256) {
            return Ok((tables.ssh_keys[id].clone(), false));
        }

        let mut key = SshKey {
            id: Uuid::new_v4(),
            fingerprint_sha256: fingerprint_sha256.to_string(),
            fingerprint_md5: defaults.fingerprint_md5,
            key_type: defaults.key_type,
            key_bits: defaults.key_bits,
            public_key_data: defaults.public_key_data,
            comment: defaults.comment,
            is_host_key: defaults.is_host_key,
            first_seen_at: Utc::now(),
            file_mtime: defaults.file_mtime,
            estimated_age_days: None,
        };
        key.recompute_age(Utc::now());
        tables
            .ssh_keys_by_fingerprint
            .insert(fingerprint_sha256.to_string(), key.id);
        tables.ssh_keys.insert(key.id, key.clone());
        Ok((key, true))
    }

    async fn narrow_key_mtime(
        &self,
        ssh_key_id: Uuid,
        observed_mtime: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = tables
            .ssh_keys
            .get_mut(&ssh_key_id)
            .ok_or_else(|| KeyspiderError::NotFound(ssh_key_id.to_string()))?;
        if let Some(observed) = observed_mtime {
            key.file_mtime = Some(match key.file_mtime {
                Some(current) => current.min(observed),
                None => observed,
            });
        }
        let now = Utc::now();
        key.recompute_age(now);
        Ok(())
    }

    async fn keys_by_fingerprint(&self, fingerprints: &[String]) -> Result<HashMap<String, Uuid>> {
        let tables = self.tables.read().await;
        Ok(fingerprints
            .iter()
            .filter_map(|fp| tables.ssh_keys_by_fingerprint.get(fp).map(|id| (fp.clone(), *id)))
            .collect())
    }

    async fn servers_by_ip(&self, ips: &[String]) -> Result<HashMap<String, Uuid>> {
        let tables = self.tables.read().await;
        let mut out = HashMap::new();
        for ip in ips {
            if let Some((_, id)) = tables
                .servers_by_key
                .iter()
                .find(|((server_ip, _), _)| server_ip == ip)
            {
                out.insert(ip.clone(), *id);
            }
        }
        Ok(out)
    }

    async fn upsert_key_location(&self, location: KeyLocationUpsert) -> Result<KeyLocation> {
        let mut tables = self.tables.write().await;
        let map_key = (
            location.ssh_key_id,
            location.server_id,
            location.file_path.clone(),
        );
        let entry = tables
            .key_locations
            .entry(map_key)
            .or_insert_with(|| KeyLocation {
                ssh_key_id: location.ssh_key_id,
                server_id: location.server_id,
                file_path: location.file_path.clone(),
                file_type: location.file_type,
                unix_owner: None,
                unix_permissions: None,
                graph_layer: KeyLocation::initial_layer(location.file_type),
                file_mtime: None,
                file_size: None,
                last_verified_at: None,
            });
        entry.unix_owner = location.unix_owner;
        entry.unix_permissions = location.unix_permissions;
        entry.file_mtime = location.file_mtime;
        entry.file_size = location.file_size;
        entry.last_verified_at = Some(Utc::now());
        Ok(entry.clone())
    }

    async fn key_locations_for_server(&self, server_id: Uuid) -> Result<Vec<KeyLocation>> {
        let tables = self.tables.read().await;
        Ok(tables
            .key_locations
            .values()
            .filter(|l| l.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn insert_access_events(&self, events: &[AccessEvent]) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.access_events.extend_from_slice(events);
        Ok(())
    }

    async fn upsert_access_path(
        &self,
        key: AccessPathUpsertKey,
        event_time: chrono::DateTime<Utc>,
    ) -> Result<AccessPath> {
        let mut tables = self.tables.write().await;
        let existing = tables.access_paths.values_mut().find(|p| {
            p.source_server_id == key.source_server_id
                && p.target_server_id == key.target_server_id
                && p.ssh_key_id == key.ssh_key_id
                && p.username == key.username
        });

        if let Some(path) = existing {
            path.event_count += 1;
            path.last_seen_at = path.last_seen_at.max(event_time);
            path.is_used = true;
            return Ok(path.clone());
        }

        let path = AccessPath {
            id: Uuid::new_v4(),
            source_server_id: key.source_server_id,
            target_server_id: key.target_server_id,
            ssh_key_id: key.ssh_key_id,
            username: key.username,
            first_seen_at: event_time,
            last_seen_at: event_time,
            event_count: 1,
            is_active: true,
            is_authorized: false,
            is_used: true,
        };
        tables.access_paths.insert(path.id, path.clone());
        Ok(path)
    }

    async fn access_paths_for_target(&self, target_server_id: Uuid) -> Result<Vec<AccessPath>> {
        let tables = self.tables.read().await;
        Ok(tables
            .access_paths
            .values()
            .filter(|p| p.target_server_id == target_server_id)
            .cloned()
            .collect())
    }

    async fn access_paths_involving_server(&self, server_id: Uuid) -> Result<Vec<AccessPath>> {
        let tables = self.tables.read().await;
        Ok(tables
            .access_paths
            .values()
            .filter(|p| p.target_server_id == server_id || p.source_server_id == Some(server_id))
            .cloned()
            .collect())
    }

    async fn access_paths_for_key(&self, ssh_key_id: Uuid) -> Result<Vec<AccessPath>> {
        let tables = self.tables.read().await;
        Ok(tables
            .access_paths
            .values()
            .filter(|p| p.ssh_key_id == Some(ssh_key_id) && p.is_active)
            .cloned()
            .collect())
    }

    async fn set_access_path_layers(&self, id: Uuid, is_authorized: bool, is_used: bool) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(path) = tables.access_paths.get_mut(&id) {
            path.is_authorized = is_authorized;
            path.is_used = is_used;
        }
        Ok(())
    }

    async fn set_key_location_layer(
        &self,
        id: (Uuid, Uuid, String),
        layer: GraphLayer,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(loc) = tables.key_locations.get_mut(&id) {
            loc.graph_layer = layer;
        }
        Ok(())
    }

    async fn upsert_unreachable_source(
        &self,
        key: UnreachableSourceUpsertKey,
        event_time: chrono::DateTime<Utc>,
    ) -> Result<UnreachableSource> {
        let mut tables = self.tables.write().await;
        let map_key = (key.source_ip.clone(), key.target_server_id, key.fingerprint.clone());
        let entry = tables.unreachable_sources.entry(map_key).or_insert_with(|| {
            UnreachableSource {
                id: Uuid::new_v4(),
                source_ip: key.source_ip.clone(),
                reverse_dns: key.reverse_dns.clone(),
                fingerprint: key.fingerprint.clone(),
                ssh_key_id: None,
                target_server_id: key.target_server_id,
                username: key.username.clone(),
                first_seen_at: event_time,
                last_seen_at: event_time,
                event_count: 0,
                severity: key.severity,
                notes: None,
                acknowledged: false,
                acknowledged_by: None,
            }
        });
        entry.event_count += 1;
        entry.last_seen_at = entry.last_seen_at.max(event_time);
        entry.severity = key.severity;
        Ok(entry.clone())
    }

    async fn list_unreachable_sources(&self, page: PageQuery) -> Result<Page<UnreachableSource>> {
        let tables = self.tables.read().await;
        let mut all: Vec<UnreachableSource> = tables.unreachable_sources.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit.max(1) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn get_agent_status(&self, server_id: Uuid) -> Result<Option<AgentStatus>> {
        Ok(self.tables.read().await.agent_statuses.get(&server_id).cloned())
    }

    async fn upsert_agent_status(&self, status: AgentStatus) -> Result<()> {
        self.tables
            .write()
            .await
            .agent_statuses
            .insert(status.server_id, status);
        Ok(())
    }

    async fn find_agent_by_token_hash(&self, token_hash: &str) -> Result<Option<AgentStatus>> {
        Ok(self
            .tables
            .read()
            .await
            .agent_statuses
            .values()
            .find(|a| a.agent_token_hash == token_hash)
            .cloned())
    }

    async fn mark_stale_agents_inactive(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut marked = 0;
        for status in tables.agent_statuses.values_mut() {
            let stale = match status.last_heartbeat_at {
                Some(t) => t < cutoff,
                None => true,
            };
            if stale && status.deployment_status == crate::models::DeploymentStatus::Active {
                status.deployment_status = crate::models::DeploymentStatus::Inactive;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn insert_sudo_events(&self, events: &[SudoEvent]) -> Result<()> {
        self.tables.write().await.sudo_events.extend_from_slice(events);
        Ok(())
    }

    async fn create_scan_job(&self, job: ScanJob) -> Result<ScanJob> {
        self.tables.write().await.scan_jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn update_scan_job_status(
        &self,
        id: Uuid,
        status: ScanJobStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let job = tables
            .scan_jobs
            .get_mut(&id)
            .ok_or_else(|| KeyspiderError::NotFound(id.to_string()))?;
        job.status = status;
        if error_message.is_some() {
            job.error_message = error_message;
        }
        match status {
            ScanJobStatus::Running if job.started_at.is_none() => job.started_at = Some(Utc::now()),
            ScanJobStatus::Complete | ScanJobStatus::Failed | ScanJobStatus::Cancelled => {
                job.finished_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    async fn create_watch_session(&self, session: WatchSession) -> Result<WatchSession> {
        self.tables
            .write()
            .await
            .watch_sessions
            .insert(session.id, session.clone());
        Ok(session)
    }

    async fn update_watch_session_status(
        &self,
        id: Uuid,
        status: WatchSessionStatus,
        last_line_at: Option<chrono::DateTime<Utc>>,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let session = tables
            .watch_sessions
            .get_mut(&id)
            .ok_or_else(|| KeyspiderError::NotFound(id.to_string()))?;
        session.status = status;
        if last_line_at.is_some() {
            session.last_line_at = last_line_at;
        }
        if last_error.is_some() {
            session.last_error = last_error;
        }
        Ok(())
    }

    async fn reconcile_host(&self, server_id: Uuid) -> Result<ReconcileSummary> {
        let (authorized_locations, used_key_ids) = {
            let tables = self.tables.read().await;
            let authorized: Vec<(Uuid, Uuid, String)> = tables
                .key_locations
                .values()
                .filter(|l| l.server_id == server_id && l.file_type == FileType::AuthorizedKeys)
                .map(|l| (l.ssh_key_id, l.server_id, l.file_path.clone()))
                .collect();
            let used: std::collections::HashSet<Uuid> = tables
                .access_events
                .iter()
                .filter(|e| {
                    e.target_server_id == server_id
                        && e.event_type == crate::models::EventType::Accepted
                })
                .filter_map(|e| e.ssh_key_id)
                .collect();
            (authorized, used)
        };

        let authorized_key_ids: std::collections::HashSet<Uuid> =
            authorized_locations.iter().map(|(k, _, _)| *k).collect();

        let mut summary = ReconcileSummary::default();

        for (key_id, srv_id, path) in &authorized_locations {
            if used_key_ids.contains(key_id) {
                self.set_key_location_layer((*key_id, *srv_id, path.clone()), GraphLayer::Both)
                    .await?;
                summary.locations_promoted += 1;
            }
        }

        let paths = self.access_paths_for_target(server_id).await?;
        for path in paths {
            let is_authorized = path.ssh_key_id.map(|k| authorized_key_ids.contains(&k)).unwrap_or(false);
            let is_used = path.ssh_key_id.map(|k| used_key_ids.contains(&k)).unwrap_or(path.is_used);
            self.set_access_path_layers(path.id, is_authorized, is_used).await?;
            summary.paths_updated += 1;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KeyType;

    fn server_defaults() -> ServerDefaults {
        ServerDefaults {
            hostname: "web01".to_string(),
            os_type: OsType::Linux,
            discovered_via: DiscoveredVia::Manual,
            prefer_agent: false,
        }
    }

    #[tokio::test]
    async fn get_or_create_server_is_idempotent() {
        let store = MemoryStore::new();
        let (a, created_a) = store
            .get_or_create_server("10.0.0.1", 22, server_defaults())
            .await
            .unwrap();
        let (b, created_b) = store
            .get_or_create_server("10.0.0.1", 22, server_defaults())
            .await
            .unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn s6_reconciliation_promotes_used_authorized_key() {
        let store = MemoryStore::new();
        let (server, _) = store
            .get_or_create_server("10.0.0.5", 22, server_defaults())
            .await
            .unwrap();
        let (key, _) = store
            .get_or_create_ssh_key(
                "SHA256:deadbeef",
                SshKeyDefaults {
                    fingerprint_md5: None,
                    key_type: KeyType::Ed25519,
                    key_bits: None,
                    public_key_data: "AAAA".to_string(),
                    comment: None,
                    is_host_key: false,
                    file_mtime: None,
                },
            )
            .await
            .unwrap();

        store
            .upsert_key_location(KeyLocationUpsert {
                ssh_key_id: key.id,
                server_id: server.id,
                file_path: "/home/alice/.ssh/authorized_keys".to_string(),
                file_type: FileType::AuthorizedKeys,
                unix_owner: Some("alice".to_string()),
                unix_permissions: Some(0o600),
                file_mtime: None,
                file_size: None,
            })
            .await
            .unwrap();

        store
            .insert_access_events(&[AccessEvent {
                id: Uuid::new_v4(),
                target_server_id: server.id,
                source_ip: "203.0.113.9".to_string(),
                source_server_id: None,
                ssh_key_id: Some(key.id),
                fingerprint: Some(key.fingerprint_sha256.clone()),
                username: "alice".to_string(),
                auth_method: Some(crate::models::AuthMethod::PublicKey),
                event_type: crate::models::EventType::Accepted,
                event_time: Utc::now(),
                raw_log_line: "...".to_string(),
                log_source: crate::models::LogSource::Spider,
            }])
            .await
            .unwrap();

        store
            .upsert_access_path(
                AccessPathUpsertKey {
                    source_server_id: None,
                    target_server_id: server.id,
                    ssh_key_id: Some(key.id),
                    username: "alice".to_string(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let summary = store.reconcile_host(server.id).await.unwrap();
        assert_eq!(summary.locations_promoted, 1);

        let locations = store.key_locations_for_server(server.id).await.unwrap();
        assert_eq!(locations[0].graph_layer, GraphLayer::Both);

        let paths = store.access_paths_for_target(server.id).await.unwrap();
        assert!(paths[0].is_authorized);
        assert!(paths[0].is_used);
    }
}
