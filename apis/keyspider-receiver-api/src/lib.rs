// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dropshot API trait for the four agent-mode ingestion endpoints.
//!
//! Every endpoint here is authenticated by the caller's `Authorization:
//! Bearer <token>` header, resolved by the implementation against
//! `AgentStatus.agent_token_hash` — this trait only describes the wire
//! shapes and routes; the manager service owns the token lookup.
//!
//! ## Endpoints
//!
//! - `POST /api/agent/heartbeat` - advance an agent's liveness watermark
//! - `POST /api/agent/events` - ingest a batch of SSH auth events
//! - `POST /api/agent/sudo-events` - ingest a batch of sudo events
//! - `POST /api/agent/keys` - ingest a batch of discovered keys

use chrono::{DateTime, Utc};
use dropshot::{HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, RequestContext, TypedBody};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct HeartbeatRequest {
    pub server_id: String,
    pub agent_version: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AgentEventPayload {
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub username: String,
    pub auth_method: Option<String>,
    pub event_type: String,
    pub fingerprint: Option<String>,
    pub port: Option<u16>,
    pub raw_line: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AgentEventsRequest {
    pub server_id: String,
    pub events: Vec<AgentEventPayload>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AgentSudoEventPayload {
    pub timestamp: DateTime<Utc>,
    pub username: String,
    pub tty: Option<String>,
    pub working_dir: Option<String>,
    pub target_user: Option<String>,
    pub command: Option<String>,
    pub success: bool,
    pub raw_line: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AgentSudoEventsRequest {
    pub server_id: String,
    pub events: Vec<AgentSudoEventPayload>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AgentKeyPayload {
    pub public_key_data: String,
    pub file_path: String,
    pub file_type: String,
    pub unix_owner: Option<String>,
    pub unix_permissions: Option<u32>,
    pub file_mtime: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub is_host_key: bool,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AgentKeysRequest {
    pub server_id: String,
    pub keys: Vec<AgentKeyPayload>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct IngestAck {
    pub accepted: u32,
}

/// Agent-mode ingestion API.
///
/// A lightweight on-host agent calls these four routes in place of the
/// spider's SSH-based acquisition; every route authenticates the same way
/// and reuses the same batch-correlate-and-persist logic the spider uses
/// after a scan.
#[dropshot::api_description]
pub trait AgentReceiverApi {
    type Context: Send + Sync + 'static;

    /// Advance `last_heartbeat_at`, set `deployment_status=active`, and
    /// refresh `agent_version` for the authenticated agent.
    #[endpoint {
        method = POST,
        path = "/api/agent/heartbeat",
    }]
    async fn heartbeat(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<HeartbeatRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Ingest a batch of SSH authentication events observed by the agent.
    #[endpoint {
        method = POST,
        path = "/api/agent/events",
    }]
    async fn ingest_events(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<AgentEventsRequest>,
    ) -> Result<HttpResponseOk<IngestAck>, HttpError>;

    /// Ingest a batch of sudo events observed by the agent.
    #[endpoint {
        method = POST,
        path = "/api/agent/sudo-events",
    }]
    async fn ingest_sudo_events(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<AgentSudoEventsRequest>,
    ) -> Result<HttpResponseOk<IngestAck>, HttpError>;

    /// Ingest a batch of discovered keys from the agent's inventory scan.
    #[endpoint {
        method = POST,
        path = "/api/agent/keys",
    }]
    async fn ingest_keys(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<AgentKeysRequest>,
    ) -> Result<HttpResponseOk<IngestAck>, HttpError>;
}
