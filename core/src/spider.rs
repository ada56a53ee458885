// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Breadth-first crawl over the SSH access graph: for every reachable host,
//! pull its keys and sshd log, persist what was found, reconcile that
//! host's layers, and follow the IPs its log mentions onward.
//!
//! A single scan's BFS state (frontier, visited set, progress) belongs to
//! one task; the only thing it shares with the rest of the process is the
//! connection pool and the persistence store, both handed in by the caller.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fingerprint;
use crate::key_scanner;
use crate::log_parser;
use crate::models::{DiscoveredVia, EventType, FileType, OsType, SudoEvent};
use crate::persistence::{
    AccessPathUpsertKey, KeyLocationUpsert, PersistenceStore, ServerDefaults, SshKeyDefaults,
    UnreachableSourceUpsertKey,
};
use crate::ssh_pool::SshPool;
use crate::unreachable::UnreachableSourceClassifier;

/// Typical initial log window on first scan or after a detected rotation.
pub const LOG_MAX_LINES_INITIAL: usize = 50_000;
/// Window used for an incremental tail when the watermark is already set.
pub const LOG_MAX_LINES_INCREMENTAL: usize = 2_000;

#[derive(Debug, Clone, Default)]
pub struct SpiderProgress {
    pub servers_scanned: u64,
    pub keys_found: u64,
    pub events_parsed: u64,
    pub unreachable_found: u64,
    pub current_depth: u32,
    pub current_server: Option<String>,
}

pub type ProgressCallback = Box<dyn Fn(&SpiderProgress) + Send + Sync>;

pub struct SpiderEngine {
    pool: Arc<SshPool>,
    store: Arc<dyn PersistenceStore>,
    classifier: UnreachableSourceClassifier,
    cancel: Arc<AtomicBool>,
    progress_callback: Option<ProgressCallback>,
}

struct FrontierEntry {
    hostname: String,
    port: u16,
    depth: u32,
}

struct LogAcquisition {
    lines: Vec<String>,
    observed_size: Option<u64>,
    /// Set when these lines came from the SFTP-tail fallback rather than
    /// `journalctl --since`, which means they still need watermark
    /// filtering before persisting (§4.9 step 5).
    via_sftp_tail: bool,
}

struct ScanOutcome {
    discovered_ips: Vec<String>,
    new_watermark: Option<chrono::DateTime<Utc>>,
    new_log_size: Option<u64>,
}

impl SpiderEngine {
    pub fn new(pool: Arc<SshPool>, store: Arc<dyn PersistenceStore>) -> Self {
        SpiderEngine {
            pool: pool.clone(),
            store,
            classifier: UnreachableSourceClassifier::new(pool),
            cancel: Arc::new(AtomicBool::new(false)),
            progress_callback: None,
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn notify(&self, progress: &SpiderProgress) {
        if let Some(cb) = &self.progress_callback {
            cb(progress);
        }
    }

    /// Crawl starting from `root_hostname:root_port`, to depth `max_depth`.
    pub async fn run(&self, root_hostname: &str, root_port: u16, max_depth: u32) -> Result<SpiderProgress> {
        let mut progress = SpiderProgress::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<FrontierEntry> = VecDeque::new();
        frontier.push_back(FrontierEntry {
            hostname: root_hostname.to_string(),
            port: root_port,
            depth: 0,
        });

        while let Some(entry) = frontier.pop_front() {
            if self.is_cancelled() {
                info!("spider: cancellation observed, stopping crawl");
                break;
            }

            let key = format!("{}:{}", entry.hostname, entry.port);
            if visited.contains(&key) || entry.depth > max_depth {
                continue;
            }
            visited.insert(key.clone());

            progress.current_depth = entry.depth;
            progress.current_server = Some(key.clone());
            self.notify(&progress);

            match self.scan_one(&entry, &mut progress).await {
                Ok(discovered_ips) => {
                    for ip in discovered_ips {
                        if !visited.contains(&ip) {
                            if let Some((host, port)) = ip.rsplit_once(':') {
                                if let Ok(port) = port.parse::<u16>() {
                                    frontier.push_back(FrontierEntry {
                                        hostname: host.to_string(),
                                        port,
                                        depth: entry.depth + 1,
                                    });
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(host = %entry.hostname, port = entry.port, error = %e, "spider: host scan failed");
                }
            }
        }

        Ok(progress)
    }

    /// Scan a single frontier entry. Returns the `host:port` strings of
    /// every newly-enqueueable server discovered by chain-following.
    async fn scan_one(&self, entry: &FrontierEntry, progress: &mut SpiderProgress) -> Result<Vec<String>> {
        let (server, created) = self
            .store
            .get_or_create_server(
                &entry.hostname,
                entry.port,
                ServerDefaults {
                    hostname: entry.hostname.clone(),
                    os_type: OsType::Linux,
                    discovered_via: if entry.depth == 0 {
                        DiscoveredVia::Manual
                    } else {
                        DiscoveredVia::Scan
                    },
                    prefer_agent: false,
                },
            )
            .await?;
        debug!(host = %entry.hostname, created, "spider: server upserted");

        if server.prefer_agent {
            if let Some(agent) = self.store.get_agent_status(server.id).await? {
                let fresh = agent.is_heartbeat_fresh(Utc::now());
                if agent.deployment_status == crate::models::DeploymentStatus::Active && fresh {
                    self.store
                        .update_server_scan_state(server.id, Utc::now(), true, None, None)
                        .await?;
                    progress.servers_scanned += 1;
                    self.notify(progress);
                    return Ok(Vec::new());
                }
            }
        }

        let guard = self.pool.acquire(&entry.hostname, entry.port).await.map_err(|e| {
            crate::error::KeyspiderError::Connect(e.to_string())
        })?;

        let scan_result = self.scan_via_session(&server, guard.session.clone(), progress).await;
        self.pool.release(guard).await;

        let scanned = scan_result?;

        self.store
            .update_server_scan_state(
                server.id,
                Utc::now(),
                true,
                scanned.new_watermark,
                scanned.new_log_size,
            )
            .await?;
        progress.servers_scanned += 1;
        self.notify(progress);

        Ok(scanned.discovered_ips)
    }

    async fn scan_via_session(
        &self,
        server: &crate::models::Server,
        session: Arc<tokio::sync::Mutex<crate::ssh_pool::SshSession>>,
        progress: &mut SpiderProgress,
    ) -> Result<ScanOutcome> {
        let log_result = self.acquire_log_lines(server, session.clone()).await;

        let discovered_keys = {
            let mut guard = session.lock().await;
            match guard.open_sftp().await {
                Some(sftp) => key_scanner::scan_host(&sftp).await,
                None => Vec::new(),
            }
        };

        for key in &discovered_keys {
            let file_type = infer_file_type(key);
            self.persist_key(server.id, key, file_type).await?;
        }
        progress.keys_found += discovered_keys.len() as u64;

        let mut events = log_parser::parse_log(
            &log_result.lines.iter().map(String::as_str).collect::<Vec<_>>(),
            server.os_type,
            Utc::now(),
        );

        // The SFTP-tail fallback re-reads its whole window every scan, so
        // without this the same lines would be re-persisted as new events
        // on every pass; journalctl's own `--since` already excludes them.
        if log_result.via_sftp_tail {
            if let Some(watermark) = server.scan_watermark {
                events.retain(|e| e.timestamp > watermark);
            }
        }
        progress.events_parsed += events.len() as u64;

        // Watermark advances to the max observed event timestamp, never
        // backward — an empty batch leaves the stored watermark untouched.
        let new_watermark = events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .map(|max_seen| match server.scan_watermark {
                Some(current) => current.max(max_seen),
                None => max_seen,
            })
            .or(server.scan_watermark);

        let discovered_ips = self.persist_events(server, &events).await?;

        self.store.reconcile_host(server.id).await?;

        Ok(ScanOutcome {
            discovered_ips,
            new_watermark,
            new_log_size: log_result.observed_size,
        })
    }

    /// journalctl first, SFTP tail fallback. Rotation (current size smaller
    /// than the stored watermark-adjacent size) forces a full initial
    /// window rather than the usual incremental one.
    async fn acquire_log_lines(
        &self,
        server: &crate::models::Server,
        session: Arc<tokio::sync::Mutex<crate::ssh_pool::SshSession>>,
    ) -> LogAcquisition {
        let mut guard = session.lock().await;

        let window = if server.scan_watermark.is_some() {
            LOG_MAX_LINES_INCREMENTAL
        } else {
            LOG_MAX_LINES_INITIAL
        };

        let journal_cmd = match server.scan_watermark {
            Some(wm) => format!(
                "journalctl -u sshd --output=json -n {} --since='{}'",
                window,
                wm.to_rfc3339()
            ),
            None => format!("journalctl -u sshd --output=json -n {}", window),
        };

        if let Some((status, stdout)) = guard.exec(&journal_cmd).await {
            if status == 0 && !stdout.trim().is_empty() {
                let lines: Vec<String> = stdout
                    .lines()
                    .filter_map(log_parser::parse_journald_json)
                    .map(|e| e.raw_line)
                    .collect();
                if !lines.is_empty() {
                    // journald has no file-size concept; leave the SFTP
                    // rotation watermark (`last_log_size`) untouched.
                    return LogAcquisition {
                        lines,
                        observed_size: server.last_log_size,
                        via_sftp_tail: false,
                    };
                }
            }
        }

        let path = match server.os_type {
            OsType::Linux => "/var/log/auth.log",
            OsType::Aix => "/var/adm/syslog",
        };

        let Some(sftp) = guard.open_sftp().await else {
            return LogAcquisition {
                lines: Vec::new(),
                observed_size: server.last_log_size,
                via_sftp_tail: true,
            };
        };

        let current_size = crate::sftp::get_size(&sftp, path).await.unwrap_or(0);
        let rotated = server
            .last_log_size
            .map(|last| current_size < last)
            .unwrap_or(false);
        let effective_window = if rotated { LOG_MAX_LINES_INITIAL } else { window };

        let lines = crate::sftp::read_tail(&sftp, path, effective_window, 64 * 1024 * 1024)
            .await
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default();

        LogAcquisition {
            lines,
            observed_size: Some(current_size),
            via_sftp_tail: true,
        }
    }

    async fn persist_key(
        &self,
        server_id: uuid::Uuid,
        key: &key_scanner::DiscoveredKey,
        file_type: FileType,
    ) -> Result<()> {
        let key_type = fingerprint::detect_key_type(&key.parsed.key_type_tag);
        let key_bits = fingerprint::estimate_key_bits(&key.parsed.key_type_tag, &key.parsed.key_bytes);

        let (ssh_key, _) = self
            .store
            .get_or_create_ssh_key(
                &key.fingerprint_sha256,
                SshKeyDefaults {
                    fingerprint_md5: key.fingerprint_md5.clone(),
                    key_type,
                    key_bits,
                    public_key_data: base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        &key.parsed.key_bytes,
                    ),
                    comment: key.parsed.comment.clone(),
                    is_host_key: key.is_host_key,
                    file_mtime: key.file_mtime,
                },
            )
            .await?;

        self.store.narrow_key_mtime(ssh_key.id, key.file_mtime).await?;

        self.store
            .upsert_key_location(KeyLocationUpsert {
                ssh_key_id: ssh_key.id,
                server_id,
                file_path: key.file_path.clone(),
                file_type,
                unix_owner: key.unix_owner.clone(),
                unix_permissions: key.unix_permissions,
                file_mtime: key.file_mtime,
                file_size: key.file_size,
            })
            .await?;

        Ok(())
    }

    /// Persist every parsed event, batch-correlating fingerprints and
    /// source IPs to existing keys/servers first. Returns the `host:port`
    /// strings for IPs that should be followed onward by the BFS.
    async fn persist_events(
        &self,
        server: &crate::models::Server,
        events: &[log_parser::AuthEvent],
    ) -> Result<Vec<String>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let fingerprints: Vec<String> = events.iter().filter_map(|e| e.fingerprint.clone()).collect();
        let fp_to_key = self.store.keys_by_fingerprint(&fingerprints).await?;

        let source_ips: Vec<String> = events.iter().map(|e| e.source_ip.clone()).collect();
        let ip_to_server = self.store.servers_by_ip(&source_ips).await?;

        let access_events: Vec<crate::models::AccessEvent> = events
            .iter()
            .map(|e| crate::models::AccessEvent {
                id: uuid::Uuid::new_v4(),
                target_server_id: server.id,
                source_ip: e.source_ip.clone(),
                source_server_id: ip_to_server.get(&e.source_ip).copied(),
                ssh_key_id: e.fingerprint.as_ref().and_then(|fp| fp_to_key.get(fp).copied()),
                fingerprint: e.fingerprint.clone(),
                username: e.username.clone(),
                auth_method: e.auth_method,
                event_type: e.event_type,
                event_time: e.timestamp,
                raw_log_line: e.raw_line.clone(),
                log_source: crate::models::LogSource::Spider,
            })
            .collect();

        self.store.insert_access_events(&access_events).await?;

        for event in events.iter().filter(|e| e.event_type == EventType::Accepted) {
            let ssh_key_id = event.fingerprint.as_ref().and_then(|fp| fp_to_key.get(fp).copied());
            self.store
                .upsert_access_path(
                    AccessPathUpsertKey {
                        source_server_id: ip_to_server.get(&event.source_ip).copied(),
                        target_server_id: server.id,
                        ssh_key_id,
                        username: event.username.clone(),
                    },
                    event.timestamp,
                )
                .await?;
        }

        self.follow_chain(server, events, &ip_to_server).await
    }

    async fn follow_chain(
        &self,
        server: &crate::models::Server,
        events: &[log_parser::AuthEvent],
        ip_to_server: &std::collections::HashMap<String, uuid::Uuid>,
    ) -> Result<Vec<String>> {
        let mut seen_ips: HashSet<String> = HashSet::new();
        let mut to_enqueue = Vec::new();

        for event in events {
            if !seen_ips.insert(event.source_ip.clone()) {
                continue;
            }

            if let Some(server_id) = ip_to_server.get(&event.source_ip) {
                if let Some(known) = self.store.get_server(*server_id).await? {
                    to_enqueue.push(known.host_port());
                    continue;
                }
            }

            if self.classifier.is_reachable(&event.source_ip, server.ssh_port).await {
                let (new_server, _) = self
                    .store
                    .get_or_create_server(
                        &event.source_ip,
                        server.ssh_port,
                        ServerDefaults {
                            hostname: event.source_ip.clone(),
                            os_type: OsType::Linux,
                            discovered_via: DiscoveredVia::Scan,
                            prefer_agent: false,
                        },
                    )
                    .await?;
                to_enqueue.push(new_server.host_port());
            } else {
                let reverse_dns = self.classifier.reverse_dns(&event.source_ip).await;
                let severity = UnreachableSourceClassifier::classify_severity(
                    &event.source_ip,
                    Some(&event.username),
                    event.fingerprint.as_deref(),
                );
                self.store
                    .upsert_unreachable_source(
                        UnreachableSourceUpsertKey {
                            source_ip: event.source_ip.clone(),
                            target_server_id: server.id,
                            fingerprint: None,
                            reverse_dns,
                            username: Some(event.username.clone()),
                            severity,
                        },
                        event.timestamp,
                    )
                    .await?;
            }
        }

        Ok(to_enqueue)
    }

    /// Persist a batch of keys reported by an on-host agent, using the same
    /// get-or-create/upsert-location logic the spider uses after an SFTP
    /// scan. Unlike `scan_via_session`, the caller already knows the file
    /// type (the agent classifies it before posting), so no inference runs.
    pub async fn ingest_agent_keys(
        &self,
        server_id: uuid::Uuid,
        records: &[AgentKeyRecord],
    ) -> Result<u32> {
        let mut accepted = 0u32;
        for record in records {
            let Some(parsed) = fingerprint::parse_public_key(&record.public_key_data) else {
                debug!(file_path = %record.file_path, "agent key payload did not parse as a public key");
                continue;
            };
            let fingerprint_sha256 = fingerprint::sha256_fingerprint(&parsed.key_bytes);
            let fingerprint_md5 = Some(fingerprint::md5_fingerprint(&parsed.key_bytes));
            let discovered = key_scanner::DiscoveredKey {
                parsed,
                fingerprint_sha256,
                fingerprint_md5,
                username: None,
                file_path: record.file_path.clone(),
                is_host_key: record.is_host_key,
                is_private_key_metadata: record.file_type == FileType::PrivateKey,
                file_mtime: record.file_mtime,
                file_size: record.file_size,
                unix_owner: record.unix_owner.clone(),
                unix_permissions: record.unix_permissions,
            };
            self.persist_key(server_id, &discovered, record.file_type).await?;
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Persist a batch of SSH auth events reported by an on-host agent,
    /// reusing `persist_events` (batch fingerprint/IP correlation, access
    /// path upsert, chain-following) exactly as the spider does post-scan.
    pub async fn ingest_agent_events(
        &self,
        server: &crate::models::Server,
        events: &[log_parser::AuthEvent],
    ) -> Result<Vec<String>> {
        self.persist_events(server, events).await
    }

    /// Persist a batch of sudo events reported by an on-host agent.
    pub async fn ingest_agent_sudo_events(&self, events: &[SudoEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.store.insert_sudo_events(events).await
    }

    /// Run the per-host reconciler; called by the receiver after a batch of
    /// agent-reported events/keys commits, mirroring the spider's own
    /// post-scan call.
    pub async fn reconcile(&self, server_id: uuid::Uuid) -> Result<crate::persistence::ReconcileSummary> {
        self.store.reconcile_host(server_id).await
    }
}

/// A key reported by an on-host agent's inventory scan, already classified
/// by file type (the agent knows whether it read an `authorized_keys` file,
/// an identity `.pub`, or a host key, so the receiver does not re-derive it).
#[derive(Debug, Clone)]
pub struct AgentKeyRecord {
    pub public_key_data: String,
    pub file_path: String,
    pub file_type: FileType,
    pub unix_owner: Option<String>,
    pub unix_permissions: Option<u32>,
    pub file_mtime: Option<chrono::DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub is_host_key: bool,
}

fn infer_file_type(key: &key_scanner::DiscoveredKey) -> FileType {
    if key.is_private_key_metadata {
        FileType::PrivateKey
    } else if key.is_host_key {
        FileType::HostKey
    } else if key.file_path.ends_with(".pub") && !key.file_path.contains("authorized_keys") {
        FileType::PublicKey
    } else {
        FileType::AuthorizedKeys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::ssh_pool::PoolConfig;
    use std::time::Duration;

    fn test_pool() -> Arc<SshPool> {
        Arc::new(SshPool::new(PoolConfig {
            max_total: 4,
            per_host: 2,
            connect_timeout: Duration::from_millis(50),
            username: "root".to_string(),
            key_path: "/nonexistent".to_string(),
        }))
    }

    #[tokio::test]
    async fn visited_set_prevents_revisiting_same_host_port() {
        let engine = SpiderEngine::new(test_pool(), Arc::new(MemoryStore::new()));
        // An unreachable root: the crawl terminates after one failed attempt
        // rather than looping, since the entry is marked visited up front.
        let progress = engine.run("198.51.100.77", 22, 2).await.unwrap();
        assert_eq!(progress.servers_scanned, 0);
    }

    #[tokio::test]
    async fn cancellation_flag_stops_before_any_scan() {
        let engine = SpiderEngine::new(test_pool(), Arc::new(MemoryStore::new()));
        engine.cancel();
        let progress = engine.run("198.51.100.78", 22, 2).await.unwrap();
        assert_eq!(progress.servers_scanned, 0);
    }

    #[test]
    fn log_window_constants_match_spec_defaults() {
        assert_eq!(LOG_MAX_LINES_INITIAL, 50_000);
        assert!(LOG_MAX_LINES_INCREMENTAL < LOG_MAX_LINES_INITIAL);
    }
}
