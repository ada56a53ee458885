// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `tokio-postgres` + `deadpool-postgres` binding of `PersistenceStore`,
//! modeled directly on the manager service's own database layer: a pooled
//! connection per call, `ON CONFLICT` upserts for the get-or-create
//! contracts, explicit transactions for the per-host commit boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::NoTls;
use uuid::Uuid;

use super::{
    AccessPathUpsertKey, KeyLocationUpsert, Page, PageQuery, PersistenceStore, ReconcileSummary,
    ServerDefaults, SshKeyDefaults, UnreachableSourceUpsertKey,
};
use crate::error::{KeyspiderError, Result};
use crate::models::{
    AccessEvent, AccessPath, AgentStatus, DeploymentStatus, DiscoveredVia, EventType, FileType,
    GraphLayer, KeyLocation, KeyType, OsType, ScanJob, ScanJobStatus, ScanJobTrigger, Server,
    Severity, SshKey, SudoEvent, UnreachableSource, WatchSession, WatchSessionStatus,
};

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e| KeyspiderError::Persistence(format!("invalid database URL: {e}")))?;

        let mut cfg = Config::new();
        if let Some(host) = pg_config.get_hosts().first() {
            match host {
                tokio_postgres::config::Host::Tcp(h) => cfg.host = Some(h.clone()),
                tokio_postgres::config::Host::Unix(p) => {
                    cfg.host = Some(p.to_string_lossy().to_string())
                }
            }
        }
        if let Some(port) = pg_config.get_ports().first() {
            cfg.port = Some(*port);
        }
        if let Some(user) = pg_config.get_user() {
            cfg.user = Some(user.to_string());
        }
        if let Some(password) = pg_config.get_password() {
            cfg.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(dbname) = pg_config.get_dbname() {
            cfg.dbname = Some(dbname.to_string());
        }

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| KeyspiderError::Persistence(format!("failed to create pool: {e}")))?;

        let client = pool
            .get()
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| KeyspiderError::Persistence(format!("failed to connect: {e}")))?;

        Ok(PostgresStore { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))
    }
}

fn row_to_server(row: &tokio_postgres::Row) -> Server {
    Server {
        id: row.get("id"),
        hostname: row.get("hostname"),
        ip_address: row.get("ip_address"),
        ssh_port: row.get::<_, i32>("ssh_port") as u16,
        os_type: parse_os_type(row.get("os_type")),
        os_version: row.get("os_version"),
        is_reachable: row.get("is_reachable"),
        last_scanned_at: row.get("last_scanned_at"),
        scan_watermark: row.get("scan_watermark"),
        last_log_size: row.get::<_, Option<i64>>("last_log_size").map(|n| n as u64),
        prefer_agent: row.get("prefer_agent"),
        discovered_via: parse_discovered_via(row.get("discovered_via")),
    }
}

fn parse_os_type(s: &str) -> OsType {
    match s {
        "aix" => OsType::Aix,
        _ => OsType::Linux,
    }
}

fn os_type_str(t: OsType) -> &'static str {
    match t {
        OsType::Linux => "linux",
        OsType::Aix => "aix",
    }
}

fn parse_discovered_via(s: &str) -> DiscoveredVia {
    match s {
        "scan" => DiscoveredVia::Scan,
        "import" => DiscoveredVia::Import,
        _ => DiscoveredVia::Manual,
    }
}

fn discovered_via_str(d: DiscoveredVia) -> &'static str {
    match d {
        DiscoveredVia::Manual => "manual",
        DiscoveredVia::Scan => "scan",
        DiscoveredVia::Import => "import",
    }
}

fn key_type_str(t: KeyType) -> &'static str {
    match t {
        KeyType::Rsa => "rsa",
        KeyType::Ed25519 => "ed25519",
        KeyType::Ecdsa => "ecdsa",
        KeyType::Dsa => "dsa",
        KeyType::Unknown => "unknown",
    }
}

fn parse_key_type(s: &str) -> KeyType {
    match s {
        "rsa" => KeyType::Rsa,
        "ed25519" => KeyType::Ed25519,
        "ecdsa" => KeyType::Ecdsa,
        "dsa" => KeyType::Dsa,
        _ => KeyType::Unknown,
    }
}

fn row_to_ssh_key(row: &tokio_postgres::Row) -> SshKey {
    SshKey {
        id: row.get("id"),
        fingerprint_sha256: row.get("fingerprint_sha256"),
        fingerprint_md5: row.get("fingerprint_md5"),
        key_type: parse_key_type(row.get("key_type")),
        key_bits: row.get::<_, Option<i32>>("key_bits").map(|n| n as u32),
        public_key_data: row.get("public_key_data"),
        comment: row.get("comment"),
        is_host_key: row.get("is_host_key"),
        first_seen_at: row.get("first_seen_at"),
        file_mtime: row.get("file_mtime"),
        estimated_age_days: row.get("estimated_age_days"),
    }
}

fn file_type_str(t: FileType) -> &'static str {
    match t {
        FileType::AuthorizedKeys => "authorized_keys",
        FileType::PublicKey => "public_key",
        FileType::PrivateKey => "private_key",
        FileType::HostKey => "host_key",
    }
}

fn parse_file_type(s: &str) -> FileType {
    match s {
        "public_key" => FileType::PublicKey,
        "private_key" => FileType::PrivateKey,
        "host_key" => FileType::HostKey,
        _ => FileType::AuthorizedKeys,
    }
}

fn graph_layer_str(l: GraphLayer) -> &'static str {
    match l {
        GraphLayer::Authorization => "authorization",
        GraphLayer::Usage => "usage",
        GraphLayer::Both => "both",
    }
}

fn parse_graph_layer(s: &str) -> GraphLayer {
    match s {
        "usage" => GraphLayer::Usage,
        "both" => GraphLayer::Both,
        _ => GraphLayer::Authorization,
    }
}

fn row_to_key_location(row: &tokio_postgres::Row) -> KeyLocation {
    KeyLocation {
        ssh_key_id: row.get("ssh_key_id"),
        server_id: row.get("server_id"),
        file_path: row.get("file_path"),
        file_type: parse_file_type(row.get("file_type")),
        unix_owner: row.get("unix_owner"),
        unix_permissions: row.get::<_, Option<i32>>("unix_permissions").map(|n| n as u32),
        graph_layer: parse_graph_layer(row.get("graph_layer")),
        file_mtime: row.get("file_mtime"),
        file_size: row.get::<_, Option<i64>>("file_size").map(|n| n as u64),
        last_verified_at: row.get("last_verified_at"),
    }
}

fn event_type_str(t: EventType) -> &'static str {
    match t {
        EventType::Accepted => "accepted",
        EventType::Failed => "failed",
        EventType::InvalidUser => "invalid_user",
        EventType::Disconnected => "disconnected",
    }
}

fn severity_str(s: Severity) -> &'static str {
    match s {
        Severity::Critical => "critical",
        Severity::High => "high",
        Severity::Medium => "medium",
        Severity::Low => "low",
    }
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "critical" => Severity::Critical,
        "high" => Severity::High,
        "medium" => Severity::Medium,
        _ => Severity::Low,
    }
}

fn row_to_unreachable(row: &tokio_postgres::Row) -> UnreachableSource {
    UnreachableSource {
        id: row.get("id"),
        source_ip: row.get("source_ip"),
        reverse_dns: row.get("reverse_dns"),
        fingerprint: row.get("fingerprint"),
        ssh_key_id: row.get("ssh_key_id"),
        target_server_id: row.get("target_server_id"),
        username: row.get("username"),
        first_seen_at: row.get("first_seen_at"),
        last_seen_at: row.get("last_seen_at"),
        event_count: row.get::<_, i64>("event_count") as u64,
        severity: parse_severity(row.get("severity")),
        notes: row.get("notes"),
        acknowledged: row.get("acknowledged"),
        acknowledged_by: row.get("acknowledged_by"),
    }
}

fn deployment_status_str(s: DeploymentStatus) -> &'static str {
    match s {
        DeploymentStatus::NotDeployed => "not_deployed",
        DeploymentStatus::Deploying => "deploying",
        DeploymentStatus::Active => "active",
        DeploymentStatus::Inactive => "inactive",
        DeploymentStatus::Error => "error",
    }
}

fn parse_deployment_status(s: &str) -> DeploymentStatus {
    match s {
        "deploying" => DeploymentStatus::Deploying,
        "active" => DeploymentStatus::Active,
        "inactive" => DeploymentStatus::Inactive,
        "error" => DeploymentStatus::Error,
        _ => DeploymentStatus::NotDeployed,
    }
}

fn row_to_agent_status(row: &tokio_postgres::Row) -> AgentStatus {
    AgentStatus {
        server_id: row.get("server_id"),
        agent_version: row.get("agent_version"),
        deployment_status: parse_deployment_status(row.get("deployment_status")),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        last_event_at: row.get("last_event_at"),
        agent_token_hash: row.get("agent_token_hash"),
        config: row.get("config"),
        installed_at: row.get("installed_at"),
        error_message: row.get("error_message"),
    }
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    async fn get_or_create_server(
        &self,
        ip_address: &str,
        ssh_port: u16,
        defaults: ServerDefaults,
    ) -> Result<(Server, bool)> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO servers (id, hostname, ip_address, ssh_port, os_type, is_reachable, prefer_agent, discovered_via)
                 VALUES ($1, $2, $3, $4, $5, false, $6, $7)
                 ON CONFLICT (ip_address, ssh_port) DO UPDATE SET ip_address = EXCLUDED.ip_address
                 RETURNING *, (xmax = 0) AS inserted",
                &[
                    &Uuid::new_v4(),
                    &defaults.hostname,
                    &ip_address,
                    &(ssh_port as i32),
                    &os_type_str(defaults.os_type),
                    &defaults.prefer_agent,
                    &discovered_via_str(defaults.discovered_via),
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;

        let created: bool = row.get("inserted");
        Ok((row_to_server(&row), created))
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM servers WHERE id = $1", &[&id])
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(row.as_ref().map(row_to_server))
    }

    async fn update_server_scan_state(
        &self,
        id: Uuid,
        last_scanned_at: DateTime<Utc>,
        is_reachable: bool,
        scan_watermark: Option<DateTime<Utc>>,
        last_log_size: Option<u64>,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE servers SET last_scanned_at = $2, is_reachable = $3,
                 scan_watermark = COALESCE($4, scan_watermark),
                 last_log_size = COALESCE($5, last_log_size)
                 WHERE id = $1",
                &[
                    &id,
                    &last_scanned_at,
                    &is_reachable,
                    &scan_watermark,
                    &last_log_size.map(|n| n as i64),
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn list_servers(&self, page: PageQuery) -> Result<Page<Server>> {
        let client = self.client().await?;
        let total: i64 = client
            .query_one("SELECT count(*) FROM servers", &[])
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?
            .get(0);
        let rows = client
            .query(
                "SELECT * FROM servers ORDER BY id OFFSET $1 LIMIT $2",
                &[&(page.offset as i64), &(page.limit.max(1) as i64)],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(Page {
            items: rows.iter().map(row_to_server).collect(),
            total: total as u64,
        })
    }

    async fn get_or_create_ssh_key(
        &self,
        fingerprint_sha256: &str,
        defaults: SshKeyDefaults,
    ) -> Result<(SshKey, bool)> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO ssh_keys
                    (id, fingerprint_sha256, fingerprint_md5, key_type, key_bits, public_key_data,
                     comment, is_host_key, first_seen_at, file_mtime)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), $9)
                 ON CONFLICT (fingerprint_sha256) DO UPDATE SET fingerprint_sha256 = EXCLUDED.fingerprint_sha256
                 RETURNING *, (xmax = 0) AS inserted",
                &[
                    &Uuid::new_v4(),
                    &fingerprint_sha256,
                    &defaults.fingerprint_md5,
                    &key_type_str(defaults.key_type),
                    &defaults.key_bits.map(|n| n as i32),
                    &defaults.public_key_data,
                    &defaults.comment,
                    &defaults.is_host_key,
                    &defaults.file_mtime,
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;

        let created: bool = row.get("inserted");
        Ok((row_to_ssh_key(&row), created))
    }

    async fn narrow_key_mtime(&self, ssh_key_id: Uuid, observed_mtime: Option<DateTime<Utc>>) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE ssh_keys SET file_mtime = LEAST(COALESCE(file_mtime, $2), COALESCE($2, file_mtime)),
                 estimated_age_days = EXTRACT(DAY FROM now() - LEAST(COALESCE(file_mtime, $2), COALESCE($2, file_mtime)))::bigint
                 WHERE id = $1",
                &[&ssh_key_id, &observed_mtime],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn keys_by_fingerprint(&self, fingerprints: &[String]) -> Result<HashMap<String, Uuid>> {
        if fingerprints.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT fingerprint_sha256, id FROM ssh_keys WHERE fingerprint_sha256 = ANY($1)",
                &[&fingerprints],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, Uuid>(1)))
            .collect())
    }

    async fn servers_by_ip(&self, ips: &[String]) -> Result<HashMap<String, Uuid>> {
        if ips.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.client().await?;
        let rows = client
            .query("SELECT ip_address, id FROM servers WHERE ip_address = ANY($1)", &[&ips])
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, Uuid>(1)))
            .collect())
    }

    async fn upsert_key_location(&self, location: KeyLocationUpsert) -> Result<KeyLocation> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO key_locations
                    (ssh_key_id, server_id, file_path, file_type, unix_owner, unix_permissions,
                     graph_layer, file_mtime, file_size, last_verified_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
                 ON CONFLICT (ssh_key_id, server_id, file_path) DO UPDATE SET
                    unix_owner = EXCLUDED.unix_owner,
                    unix_permissions = EXCLUDED.unix_permissions,
                    file_mtime = EXCLUDED.file_mtime,
                    file_size = EXCLUDED.file_size,
                    last_verified_at = now()
                 RETURNING *",
                &[
                    &location.ssh_key_id,
                    &location.server_id,
                    &location.file_path,
                    &file_type_str(location.file_type),
                    &location.unix_owner,
                    &location.unix_permissions.map(|n| n as i32),
                    &graph_layer_str(KeyLocation::initial_layer(location.file_type)),
                    &location.file_mtime,
                    &location.file_size.map(|n| n as i64),
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(row_to_key_location(&row))
    }

    async fn key_locations_for_server(&self, server_id: Uuid) -> Result<Vec<KeyLocation>> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT * FROM key_locations WHERE server_id = $1", &[&server_id])
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(rows.iter().map(row_to_key_location).collect())
    }

    async fn insert_access_events(&self, events: &[AccessEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        let stmt = tx
            .prepare(
                "INSERT INTO access_events
                    (id, target_server_id, source_ip, source_server_id, ssh_key_id, fingerprint,
                     username, auth_method, event_type, event_time, raw_log_line, log_source)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;

        for event in events {
            tx.execute(
                &stmt,
                &[
                    &event.id,
                    &event.target_server_id,
                    &event.source_ip,
                    &event.source_server_id,
                    &event.ssh_key_id,
                    &event.fingerprint,
                    &event.username,
                    &event.auth_method.map(|m| match m {
                        crate::models::AuthMethod::PublicKey => "publickey",
                        crate::models::AuthMethod::Password => "password",
                        crate::models::AuthMethod::KeyboardInteractive => "keyboard-interactive",
                    }),
                    &event_type_str(event.event_type),
                    &event.event_time,
                    &event.raw_log_line,
                    &match event.log_source {
                        crate::models::LogSource::Spider => "spider",
                        crate::models::LogSource::Agent => "agent",
                        crate::models::LogSource::Watcher => "watcher",
                    },
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn upsert_access_path(
        &self,
        key: AccessPathUpsertKey,
        event_time: DateTime<Utc>,
    ) -> Result<AccessPath> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO access_paths
                    (id, source_server_id, target_server_id, ssh_key_id, username,
                     first_seen_at, last_seen_at, event_count, is_active, is_authorized, is_used)
                 VALUES ($1, $2, $3, $4, $5, $6, $6, 1, true, false, true)
                 ON CONFLICT (source_server_id, target_server_id, ssh_key_id, username) DO UPDATE SET
                    event_count = access_paths.event_count + 1,
                    last_seen_at = GREATEST(access_paths.last_seen_at, EXCLUDED.last_seen_at),
                    is_used = true
                 RETURNING *",
                &[
                    &Uuid::new_v4(),
                    &key.source_server_id,
                    &key.target_server_id,
                    &key.ssh_key_id,
                    &key.username,
                    &event_time,
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(row_to_access_path(&row))
    }

    async fn access_paths_for_target(&self, target_server_id: Uuid) -> Result<Vec<AccessPath>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM access_paths WHERE target_server_id = $1",
                &[&target_server_id],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(rows.iter().map(row_to_access_path).collect())
    }

    async fn access_paths_involving_server(&self, server_id: Uuid) -> Result<Vec<AccessPath>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM access_paths WHERE target_server_id = $1 OR source_server_id = $1",
                &[&server_id],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(rows.iter().map(row_to_access_path).collect())
    }

    async fn access_paths_for_key(&self, ssh_key_id: Uuid) -> Result<Vec<AccessPath>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM access_paths WHERE ssh_key_id = $1 AND is_active",
                &[&ssh_key_id],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(rows.iter().map(row_to_access_path).collect())
    }

    async fn set_access_path_layers(&self, id: Uuid, is_authorized: bool, is_used: bool) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE access_paths SET is_authorized = $2, is_used = $3 WHERE id = $1",
                &[&id, &is_authorized, &is_used],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn set_key_location_layer(&self, id: (Uuid, Uuid, String), layer: GraphLayer) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE key_locations SET graph_layer = $4
                 WHERE ssh_key_id = $1 AND server_id = $2 AND file_path = $3",
                &[&id.0, &id.1, &id.2, &graph_layer_str(layer)],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn upsert_unreachable_source(
        &self,
        key: UnreachableSourceUpsertKey,
        event_time: DateTime<Utc>,
    ) -> Result<UnreachableSource> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO unreachable_sources
                    (id, source_ip, reverse_dns, fingerprint, target_server_id, username,
                     first_seen_at, last_seen_at, event_count, severity, acknowledged)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $7, 1, $8, false)
                 ON CONFLICT (source_ip, target_server_id, fingerprint) DO UPDATE SET
                    event_count = unreachable_sources.event_count + 1,
                    last_seen_at = GREATEST(unreachable_sources.last_seen_at, EXCLUDED.last_seen_at),
                    severity = EXCLUDED.severity,
                    reverse_dns = COALESCE(EXCLUDED.reverse_dns, unreachable_sources.reverse_dns)
                 RETURNING *",
                &[
                    &Uuid::new_v4(),
                    &key.source_ip,
                    &key.reverse_dns,
                    &key.fingerprint,
                    &key.target_server_id,
                    &key.username,
                    &event_time,
                    &severity_str(key.severity),
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(row_to_unreachable(&row))
    }

    async fn list_unreachable_sources(&self, page: PageQuery) -> Result<Page<UnreachableSource>> {
        let client = self.client().await?;
        let total: i64 = client
            .query_one("SELECT count(*) FROM unreachable_sources", &[])
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?
            .get(0);
        let rows = client
            .query(
                "SELECT * FROM unreachable_sources ORDER BY id OFFSET $1 LIMIT $2",
                &[&(page.offset as i64), &(page.limit.max(1) as i64)],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(Page {
            items: rows.iter().map(row_to_unreachable).collect(),
            total: total as u64,
        })
    }

    async fn get_agent_status(&self, server_id: Uuid) -> Result<Option<AgentStatus>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM agent_statuses WHERE server_id = $1", &[&server_id])
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(row.as_ref().map(row_to_agent_status))
    }

    async fn upsert_agent_status(&self, status: AgentStatus) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO agent_statuses
                    (server_id, agent_version, deployment_status, last_heartbeat_at, last_event_at,
                     agent_token_hash, config, installed_at, error_message)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (server_id) DO UPDATE SET
                    agent_version = EXCLUDED.agent_version,
                    deployment_status = EXCLUDED.deployment_status,
                    last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                    last_event_at = EXCLUDED.last_event_at,
                    agent_token_hash = EXCLUDED.agent_token_hash,
                    config = EXCLUDED.config,
                    installed_at = COALESCE(agent_statuses.installed_at, EXCLUDED.installed_at),
                    error_message = EXCLUDED.error_message",
                &[
                    &status.server_id,
                    &status.agent_version,
                    &deployment_status_str(status.deployment_status),
                    &status.last_heartbeat_at,
                    &status.last_event_at,
                    &status.agent_token_hash,
                    &status.config,
                    &status.installed_at,
                    &status.error_message,
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn find_agent_by_token_hash(&self, token_hash: &str) -> Result<Option<AgentStatus>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT * FROM agent_statuses WHERE agent_token_hash = $1",
                &[&token_hash],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(row.as_ref().map(row_to_agent_status))
    }

    async fn mark_stale_agents_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let client = self.client().await?;
        let affected = client
            .execute(
                "UPDATE agent_statuses SET deployment_status = 'inactive'
                 WHERE deployment_status = 'active'
                   AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)",
                &[&cutoff],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(affected)
    }

    async fn insert_sudo_events(&self, events: &[SudoEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        for event in events {
            tx.execute(
                "INSERT INTO sudo_events
                    (id, server_id, username, command, target_user, working_dir, tty, event_time, success, raw_log_line)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &event.id,
                    &event.server_id,
                    &event.username,
                    &event.command,
                    &event.target_user,
                    &event.working_dir,
                    &event.tty,
                    &event.event_time,
                    &event.success,
                    &event.raw_log_line,
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn create_scan_job(&self, job: ScanJob) -> Result<ScanJob> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO scan_jobs (id, root_server_id, max_depth, trigger, status)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &job.id,
                    &job.root_server_id,
                    &(job.max_depth as i32),
                    &scan_job_trigger_str(job.trigger),
                    &scan_job_status_str(job.status),
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(job)
    }

    async fn update_scan_job_status(
        &self,
        id: Uuid,
        status: ScanJobStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE scan_jobs SET status = $2,
                    error_message = COALESCE($3, error_message),
                    started_at = CASE WHEN $2 = 'running' AND started_at IS NULL THEN now() ELSE started_at END,
                    finished_at = CASE WHEN $2 IN ('complete', 'failed', 'cancelled') THEN now() ELSE finished_at END
                 WHERE id = $1",
                &[&id, &scan_job_status_str(status), &error_message],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn create_watch_session(&self, session: WatchSession) -> Result<WatchSession> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO watch_sessions (id, server_id, status, started_at)
                 VALUES ($1, $2, $3, $4)",
                &[
                    &session.id,
                    &session.server_id,
                    &watch_status_str(session.status),
                    &session.started_at,
                ],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(session)
    }

    async fn update_watch_session_status(
        &self,
        id: Uuid,
        status: WatchSessionStatus,
        last_line_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE watch_sessions SET status = $2,
                    last_line_at = COALESCE($3, last_line_at),
                    last_error = COALESCE($4, last_error)
                 WHERE id = $1",
                &[&id, &watch_status_str(status), &last_line_at, &last_error],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn reconcile_host(&self, server_id: Uuid) -> Result<ReconcileSummary> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;

        let promoted = tx
            .execute(
                "UPDATE key_locations SET graph_layer = 'both'
                 WHERE server_id = $1 AND file_type = 'authorized_keys' AND ssh_key_id IN (
                    SELECT DISTINCT ssh_key_id FROM access_events
                    WHERE target_server_id = $1 AND event_type = 'accepted' AND ssh_key_id IS NOT NULL
                 )",
                &[&server_id],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;

        let updated = tx
            .execute(
                "UPDATE access_paths p SET
                    is_authorized = EXISTS (
                        SELECT 1 FROM key_locations l
                        WHERE l.server_id = p.target_server_id AND l.file_type = 'authorized_keys'
                          AND l.ssh_key_id = p.ssh_key_id
                    ),
                    is_used = EXISTS (
                        SELECT 1 FROM access_events e
                        WHERE e.target_server_id = p.target_server_id AND e.event_type = 'accepted'
                          AND e.ssh_key_id = p.ssh_key_id
                    ) OR p.is_used
                 WHERE p.target_server_id = $1",
                &[&server_id],
            )
            .await
            .map_err(|e| KeyspiderError::Persistence(e.to_string()))?;

        tx.commit().await.map_err(|e| KeyspiderError::Persistence(e.to_string()))?;

        Ok(ReconcileSummary {
            locations_promoted: promoted,
            paths_updated: updated,
        })
    }
}

fn row_to_access_path(row: &tokio_postgres::Row) -> AccessPath {
    AccessPath {
        id: row.get("id"),
        source_server_id: row.get("source_server_id"),
        target_server_id: row.get("target_server_id"),
        ssh_key_id: row.get("ssh_key_id"),
        username: row.get("username"),
        first_seen_at: row.get("first_seen_at"),
        last_seen_at: row.get("last_seen_at"),
        event_count: row.get::<_, i64>("event_count") as u64,
        is_active: row.get("is_active"),
        is_authorized: row.get("is_authorized"),
        is_used: row.get("is_used"),
    }
}

fn scan_job_trigger_str(t: ScanJobTrigger) -> &'static str {
    match t {
        ScanJobTrigger::Manual => "manual",
        ScanJobTrigger::Scheduled => "scheduled",
        ScanJobTrigger::AgentEnrollment => "agent_enrollment",
    }
}

fn scan_job_status_str(s: ScanJobStatus) -> &'static str {
    match s {
        ScanJobStatus::Queued => "queued",
        ScanJobStatus::Running => "running",
        ScanJobStatus::Complete => "complete",
        ScanJobStatus::Failed => "failed",
        ScanJobStatus::Cancelled => "cancelled",
    }
}

fn watch_status_str(s: WatchSessionStatus) -> &'static str {
    match s {
        WatchSessionStatus::Starting => "starting",
        WatchSessionStatus::Running => "running",
        WatchSessionStatus::Backoff => "backoff",
        WatchSessionStatus::Stopped => "stopped",
        WatchSessionStatus::Error => "error",
    }
}
