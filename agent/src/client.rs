// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin HTTP client over the receiver's four ingestion routes (spec §6).
//! All errors are returned to the caller, never panicked on — the collect
//! loop logs and continues per §4.12's "all HTTP errors are logged and do
//! not interrupt the loop".

use chrono::{DateTime, Utc};
use keyspider_core::log_parser::{AuthEvent, SudoEventLine};
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use crate::inventory::LocalKeyRecord;

pub struct ReceiverClient {
    http: Client,
    base_url: String,
    token: String,
}

#[derive(Serialize)]
struct HeartbeatBody {
    server_id: Uuid,
    agent_version: String,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct EventPayload<'a> {
    timestamp: DateTime<Utc>,
    source_ip: &'a str,
    username: &'a str,
    auth_method: Option<&'a str>,
    event_type: &'a str,
    fingerprint: Option<&'a str>,
    port: Option<u16>,
    raw_line: &'a str,
}

#[derive(Serialize)]
struct EventsBody<'a> {
    server_id: Uuid,
    events: Vec<EventPayload<'a>>,
}

#[derive(Serialize)]
struct SudoEventPayload<'a> {
    timestamp: DateTime<Utc>,
    username: &'a str,
    tty: Option<&'a str>,
    working_dir: Option<&'a str>,
    target_user: Option<&'a str>,
    command: Option<&'a str>,
    success: bool,
    raw_line: &'a str,
}

#[derive(Serialize)]
struct SudoEventsBody<'a> {
    server_id: Uuid,
    events: Vec<SudoEventPayload<'a>>,
}

#[derive(Serialize)]
struct KeyPayload<'a> {
    public_key_data: &'a str,
    file_path: &'a str,
    file_type: &'a str,
    unix_owner: Option<&'a str>,
    unix_permissions: Option<u32>,
    file_mtime: Option<DateTime<Utc>>,
    file_size: Option<u64>,
    is_host_key: bool,
}

#[derive(Serialize)]
struct KeysBody<'a> {
    server_id: Uuid,
    keys: Vec<KeyPayload<'a>>,
}

impl ReceiverClient {
    pub fn new(base_url: String, token: String) -> reqwest::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { http, base_url, token })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn heartbeat(&self, server_id: Uuid, agent_version: &str) -> reqwest::Result<()> {
        let body = HeartbeatBody {
            server_id,
            agent_version: agent_version.to_string(),
            timestamp: Utc::now(),
        };
        self.http
            .post(self.url("/api/agent/heartbeat"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn post_events(&self, server_id: Uuid, events: &[AuthEvent]) -> reqwest::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let body = EventsBody {
            server_id,
            events: events.iter().map(to_event_payload).collect(),
        };
        self.http
            .post(self.url("/api/agent/events"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn post_sudo_events(&self, server_id: Uuid, events: &[SudoEventLine]) -> reqwest::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let body = SudoEventsBody {
            server_id,
            events: events.iter().map(to_sudo_payload).collect(),
        };
        self.http
            .post(self.url("/api/agent/sudo-events"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn post_keys(&self, server_id: Uuid, keys: &[LocalKeyRecord]) -> reqwest::Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let body = KeysBody {
            server_id,
            keys: keys.iter().map(to_key_payload).collect(),
        };
        self.http
            .post(self.url("/api/agent/keys"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn to_event_payload(e: &AuthEvent) -> EventPayload<'_> {
    EventPayload {
        timestamp: e.timestamp,
        source_ip: &e.source_ip,
        username: &e.username,
        auth_method: e.auth_method.map(auth_method_str),
        event_type: event_type_str(e.event_type),
        fingerprint: e.fingerprint.as_deref(),
        port: e.port,
        raw_line: &e.raw_line,
    }
}

fn to_sudo_payload(e: &SudoEventLine) -> SudoEventPayload<'_> {
    SudoEventPayload {
        timestamp: e.timestamp,
        username: &e.username,
        tty: e.tty.as_deref(),
        working_dir: e.working_dir.as_deref(),
        target_user: e.target_user.as_deref(),
        command: e.command.as_deref(),
        success: e.success,
        raw_line: &e.raw_line,
    }
}

fn to_key_payload(k: &LocalKeyRecord) -> KeyPayload<'_> {
    KeyPayload {
        public_key_data: &k.public_key_data,
        file_path: &k.file_path,
        file_type: k.file_type,
        unix_owner: k.unix_owner.as_deref(),
        unix_permissions: k.unix_permissions,
        file_mtime: k.file_mtime,
        file_size: k.file_size,
        is_host_key: k.is_host_key,
    }
}

fn auth_method_str(m: keyspider_core::models::AuthMethod) -> &'static str {
    use keyspider_core::models::AuthMethod;
    match m {
        AuthMethod::PublicKey => "publickey",
        AuthMethod::Password => "password",
        AuthMethod::KeyboardInteractive => "keyboard-interactive",
    }
}

fn event_type_str(t: keyspider_core::models::EventType) -> &'static str {
    use keyspider_core::models::EventType;
    match t {
        EventType::Accepted => "accepted",
        EventType::Failed => "failed",
        EventType::InvalidUser => "invalid_user",
        EventType::Disconnected => "disconnected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyspider_core::models::{AuthMethod, EventType};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn heartbeat_sends_bearer_token_and_server_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/heartbeat"))
            .and(header("authorization", "Bearer sekrit"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = ReceiverClient::new(server.uri(), "sekrit".to_string()).unwrap();
        let id = Uuid::new_v4();
        client.heartbeat(id, "1.0.0").await.unwrap();
    }

    #[tokio::test]
    async fn post_events_skips_request_when_empty() {
        let server = MockServer::start().await;
        // No mock mounted: an empty batch must not hit the network at all.
        let client = ReceiverClient::new(server.uri(), "sekrit".to_string()).unwrap();
        client.post_events(Uuid::new_v4(), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn post_events_serializes_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/events"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = ReceiverClient::new(server.uri(), "sekrit".to_string()).unwrap();
        let event = AuthEvent {
            timestamp: Utc::now(),
            source_ip: "10.0.1.50".to_string(),
            username: "root".to_string(),
            auth_method: Some(AuthMethod::PublicKey),
            event_type: EventType::Accepted,
            fingerprint: Some("SHA256:abc".to_string()),
            port: Some(52222),
            pid: Some(1),
            raw_line: "raw".to_string(),
        };
        client.post_events(Uuid::new_v4(), &[event]).await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_propagates_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/heartbeat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ReceiverClient::new(server.uri(), "sekrit".to_string()).unwrap();
        let result = client.heartbeat(Uuid::new_v4(), "1.0.0").await;
        assert!(result.is_err());
    }
}
