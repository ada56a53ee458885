// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(clippy::unwrap_used)]

//! Cross-module scenario tests that exercise the agent-ingestion path the
//! way the receiver does: persist a key inventory batch, persist an auth
//! event batch that uses one of those keys, reconcile, and check that the
//! resulting graph reflects both the authorization and usage layers.
//!
//! These go through `SpiderEngine::ingest_agent_*` rather than
//! `SpiderEngine::run`, since a real scan needs a reachable SSH server; the
//! ingestion path is exactly what the manager's receiver calls, and it is
//! the one piece that spans `persistence`, `spider`, `fingerprint`, and
//! `graph` together.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keyspider_core::fingerprint;
use keyspider_core::graph::{GraphBuilder, LayerFilter, NodeId};
use keyspider_core::log_parser::AuthEvent;
use keyspider_core::models::{AuthMethod, DiscoveredVia, EventType, FileType, OsType};
use keyspider_core::persistence::{MemoryStore, PersistenceStore, ServerDefaults};
use keyspider_core::spider::{AgentKeyRecord, SpiderEngine};
use keyspider_core::ssh_pool::{PoolConfig, SshPool};

const ALICE_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ5lUIu0pGPM5ITaGDUUTMmCP89YZrLNyGzWxZ1n3Wnd alice@workstation";

fn test_pool() -> Arc<SshPool> {
    Arc::new(SshPool::new(PoolConfig {
        max_total: 1,
        per_host: 1,
        connect_timeout: Duration::from_millis(50),
        username: "root".to_string(),
        key_path: "/nonexistent".to_string(),
    }))
}

/// An agent-reported authorized_keys entry, followed by a matching accepted
/// login, must promote both the key location and the access path to the
/// "both" (authorized + used) layer once reconciled, and the resulting key
/// subgraph must carry that edge.
#[tokio::test]
async fn agent_reported_key_and_login_reconcile_into_used_authorized_path() {
    let store: Arc<dyn PersistenceStore> = Arc::new(MemoryStore::new());
    let engine = SpiderEngine::new(test_pool(), store.clone());

    let (server, created) = store
        .get_or_create_server(
            "10.0.0.9",
            22,
            ServerDefaults {
                hostname: "db01".to_string(),
                os_type: OsType::Linux,
                discovered_via: DiscoveredVia::Manual,
                prefer_agent: true,
            },
        )
        .await
        .unwrap();
    assert!(created);

    let accepted = engine
        .ingest_agent_keys(
            server.id,
            &[AgentKeyRecord {
                public_key_data: ALICE_KEY.to_string(),
                file_path: "/home/alice/.ssh/authorized_keys".to_string(),
                file_type: FileType::AuthorizedKeys,
                unix_owner: Some("alice".to_string()),
                unix_permissions: Some(0o600),
                file_mtime: None,
                file_size: None,
                is_host_key: false,
            }],
        )
        .await
        .unwrap();
    assert_eq!(accepted, 1);

    let locations = store.key_locations_for_server(server.id).await.unwrap();
    assert_eq!(locations.len(), 1);
    let ssh_key_id = locations[0].ssh_key_id;

    let parsed = fingerprint::parse_public_key(ALICE_KEY).expect("fixture key parses");
    let sha256 = fingerprint::sha256_fingerprint(&parsed.key_bytes);

    let events = vec![AuthEvent {
        timestamp: Utc::now(),
        source_ip: "203.0.113.20".to_string(),
        username: "alice".to_string(),
        auth_method: Some(AuthMethod::PublicKey),
        event_type: EventType::Accepted,
        fingerprint: Some(sha256),
        port: Some(22),
        pid: None,
        raw_line: "Accepted publickey for alice from 203.0.113.20 port 51000 ssh2".to_string(),
    }];

    engine.ingest_agent_events(&server, &events).await.unwrap();
    let summary = engine.reconcile(server.id).await.unwrap();
    assert_eq!(summary.locations_promoted, 1);

    let graph = GraphBuilder::new(store.clone());
    let subgraph = graph.key_subgraph(ssh_key_id).await.unwrap();
    assert_eq!(subgraph.edges.len(), 1);
    assert!(subgraph.edges[0].is_used);
    assert_eq!(subgraph.edges[0].target, NodeId::Server(server.id));

    let full = graph.full_graph(LayerFilter::All).await.unwrap();
    assert!(full.nodes.iter().any(|n| n.id == NodeId::Server(server.id)));
}

/// A login from an IP that the scanner cannot reach and that is not itself
/// a known server must record an `UnreachableSource` rather than enqueue a
/// bogus frontier entry, and its severity must follow the classifier's
/// first-match-wins ordering.
#[tokio::test]
async fn unreachable_source_is_recorded_instead_of_enqueued() {
    let store: Arc<dyn PersistenceStore> = Arc::new(MemoryStore::new());
    let engine = SpiderEngine::new(test_pool(), store.clone());

    let (server, _) = store
        .get_or_create_server(
            "10.0.0.10",
            22,
            ServerDefaults {
                hostname: "web02".to_string(),
                os_type: OsType::Linux,
                discovered_via: DiscoveredVia::Manual,
                prefer_agent: false,
            },
        )
        .await
        .unwrap();

    let events = vec![AuthEvent {
        timestamp: Utc::now(),
        source_ip: "198.51.100.200".to_string(),
        username: "root".to_string(),
        auth_method: Some(AuthMethod::PublicKey),
        event_type: EventType::Accepted,
        fingerprint: Some("SHA256:doesnotexist".to_string()),
        port: Some(22),
        pid: None,
        raw_line: "Accepted publickey for root from 198.51.100.200 port 4444 ssh2".to_string(),
    }];

    // The pool can never reach 198.51.100.200 in this test environment, so
    // the chain-follow step falls back to recording an unreachable source.
    engine.ingest_agent_events(&server, &events).await.unwrap();

    let unreachable = store.list_unreachable_sources(Default::default()).await.unwrap();
    assert_eq!(unreachable.items.len(), 1);
    assert_eq!(unreachable.items[0].source_ip, "198.51.100.200");
    assert_eq!(unreachable.items[0].target_server_id, server.id);
}
