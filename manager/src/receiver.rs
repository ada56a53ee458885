// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of `AgentReceiverApi`: the four agent-mode ingestion
//! endpoints. Every handler authenticates by hashing the bearer token and
//! looking up `AgentStatus` by `agent_token_hash`, then reuses the spider's
//! batch-correlate-and-persist logic (§4.9 steps 7-9) exactly as it would
//! run after an SSH-based scan.

use chrono::Utc;
use dropshot::{HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, RequestContext, TypedBody};
use keyspider_core::log_parser::AuthEvent;
use keyspider_core::models::{AgentStatus, AuthMethod, DeploymentStatus, EventType, FileType, SudoEvent};
use keyspider_core::spider::AgentKeyRecord;
use keyspider_receiver_api::{
    AgentEventsRequest, AgentKeysRequest, AgentReceiverApi, AgentSudoEventsRequest, HeartbeatRequest,
    IngestAck,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::context::ApiContext;
use crate::metrics::{AGENT_EVENTS_INGESTED, AGENT_KEYS_INGESTED};

/// Agent Receiver API implementation.
pub enum ReceiverImpl {}

impl AgentReceiverApi for ReceiverImpl {
    type Context = ApiContext;

    async fn heartbeat(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<HeartbeatRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let ctx = rqctx.context();
        let token_hash = bearer_token_hash(&rqctx)?;
        let req = body.into_inner();

        let mut status = authenticate(ctx, &token_hash).await?;
        ensure_server_id_matches(&status, &req.server_id)?;

        status.last_heartbeat_at = Some(req.timestamp.unwrap_or_else(Utc::now));
        status.deployment_status = DeploymentStatus::Active;
        if let Some(version) = req.agent_version {
            status.agent_version = Some(version);
        }

        ctx.store
            .upsert_agent_status(status)
            .await
            .map_err(|e| HttpError::for_internal_error(format!("failed to record heartbeat: {e}")))?;

        Ok(HttpResponseUpdatedNoContent())
    }

    async fn ingest_events(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<AgentEventsRequest>,
    ) -> Result<HttpResponseOk<IngestAck>, HttpError> {
        let ctx = rqctx.context();
        let token_hash = bearer_token_hash(&rqctx)?;
        let status = authenticate(ctx, &token_hash).await?;
        let req = body.into_inner();

        let server = ctx
            .store
            .get_server(status.server_id)
            .await
            .map_err(|e| HttpError::for_internal_error(format!("lookup failed: {e}")))?
            .ok_or_else(|| HttpError::for_bad_request(None, "unknown server_id".to_string()))?;

        let events: Vec<AuthEvent> = req
            .events
            .iter()
            .map(|e| AuthEvent {
                timestamp: e.timestamp,
                source_ip: e.source_ip.clone(),
                username: e.username.clone(),
                auth_method: e.auth_method.as_deref().and_then(parse_auth_method),
                event_type: parse_event_type(&e.event_type),
                fingerprint: e.fingerprint.clone(),
                port: e.port,
                pid: None,
                raw_line: e.raw_line.clone(),
            })
            .collect();

        ctx.spider
            .ingest_agent_events(&server, &events)
            .await
            .map_err(|e| HttpError::for_internal_error(format!("failed to persist events: {e}")))?;
        ctx.spider
            .reconcile(server.id)
            .await
            .map_err(|e| HttpError::for_internal_error(format!("failed to reconcile: {e}")))?;

        AGENT_EVENTS_INGESTED.inc_by(events.len() as f64);
        Ok(HttpResponseOk(IngestAck {
            accepted: events.len() as u32,
        }))
    }

    async fn ingest_sudo_events(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<AgentSudoEventsRequest>,
    ) -> Result<HttpResponseOk<IngestAck>, HttpError> {
        let ctx = rqctx.context();
        let token_hash = bearer_token_hash(&rqctx)?;
        let status = authenticate(ctx, &token_hash).await?;
        let req = body.into_inner();

        let events: Vec<SudoEvent> = req
            .events
            .iter()
            .map(|e| SudoEvent {
                id: Uuid::new_v4(),
                server_id: status.server_id,
                username: e.username.clone(),
                command: e.command.clone(),
                target_user: e.target_user.clone(),
                working_dir: e.working_dir.clone(),
                tty: e.tty.clone(),
                event_time: e.timestamp,
                success: e.success,
                raw_log_line: e.raw_line.clone().unwrap_or_default(),
            })
            .collect();

        let accepted = events.len() as u32;
        ctx.spider
            .ingest_agent_sudo_events(&events)
            .await
            .map_err(|e| HttpError::for_internal_error(format!("failed to persist sudo events: {e}")))?;

        Ok(HttpResponseOk(IngestAck { accepted }))
    }

    async fn ingest_keys(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<AgentKeysRequest>,
    ) -> Result<HttpResponseOk<IngestAck>, HttpError> {
        let ctx = rqctx.context();
        let token_hash = bearer_token_hash(&rqctx)?;
        let status = authenticate(ctx, &token_hash).await?;
        let req = body.into_inner();

        let records: Vec<AgentKeyRecord> = req
            .keys
            .iter()
            .map(|k| AgentKeyRecord {
                public_key_data: k.public_key_data.clone(),
                file_path: k.file_path.clone(),
                file_type: parse_file_type(&k.file_type),
                unix_owner: k.unix_owner.clone(),
                unix_permissions: k.unix_permissions,
                file_mtime: k.file_mtime,
                file_size: k.file_size,
                is_host_key: k.is_host_key,
            })
            .collect();

        let accepted = ctx
            .spider
            .ingest_agent_keys(status.server_id, &records)
            .await
            .map_err(|e| HttpError::for_internal_error(format!("failed to persist keys: {e}")))?;
        ctx.spider
            .reconcile(status.server_id)
            .await
            .map_err(|e| HttpError::for_internal_error(format!("failed to reconcile: {e}")))?;

        AGENT_KEYS_INGESTED.inc_by(accepted as f64);
        Ok(HttpResponseOk(IngestAck { accepted }))
    }
}

/// Extract and SHA-256-hash the bearer token from `Authorization: Bearer
/// <token>`. Both a missing header and a malformed scheme return `401`,
/// matching the receiver's error policy (§7): "token absence returns 401".
fn bearer_token_hash(rqctx: &RequestContext<ApiContext>) -> Result<String, HttpError> {
    let header = rqctx
        .request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HttpError::for_client_error(
            None,
            dropshot::ClientErrorStatusCode::UNAUTHORIZED,
            "missing Authorization header".to_string(),
        ))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| HttpError::for_client_error(
            None,
            dropshot::ClientErrorStatusCode::UNAUTHORIZED,
            "Authorization header must use the Bearer scheme".to_string(),
        ))?;

    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// The heartbeat payload carries `server_id` redundantly alongside the
/// bearer token; reject a mismatch rather than silently trusting whichever
/// identity the caller claims.
fn ensure_server_id_matches(status: &AgentStatus, claimed: &str) -> Result<(), HttpError> {
    let claimed = Uuid::parse_str(claimed)
        .map_err(|_| HttpError::for_bad_request(None, format!("invalid server_id: {claimed}")))?;
    if claimed != status.server_id {
        return Err(HttpError::for_client_error(
            None,
            dropshot::ClientErrorStatusCode::UNAUTHORIZED,
            "server_id does not match the authenticated agent".to_string(),
        ));
    }
    Ok(())
}

async fn authenticate(ctx: &ApiContext, token_hash: &str) -> Result<AgentStatus, HttpError> {
    ctx.store
        .find_agent_by_token_hash(token_hash)
        .await
        .map_err(|e| HttpError::for_internal_error(format!("auth lookup failed: {e}")))?
        .ok_or_else(|| {
            HttpError::for_client_error(
                None,
                dropshot::ClientErrorStatusCode::UNAUTHORIZED,
                "unknown or revoked agent token".to_string(),
            )
        })
}

fn parse_auth_method(raw: &str) -> Option<AuthMethod> {
    match raw {
        "publickey" => Some(AuthMethod::PublicKey),
        "password" => Some(AuthMethod::Password),
        "keyboard-interactive" => Some(AuthMethod::KeyboardInteractive),
        _ => None,
    }
}

fn parse_event_type(raw: &str) -> EventType {
    match raw {
        "failed" => EventType::Failed,
        "invalid_user" => EventType::InvalidUser,
        "disconnected" => EventType::Disconnected,
        _ => EventType::Accepted,
    }
}

fn parse_file_type(raw: &str) -> FileType {
    match raw {
        "public_key" => FileType::PublicKey,
        "private_key" => FileType::PrivateKey,
        "host_key" => FileType::HostKey,
        _ => FileType::AuthorizedKeys,
    }
}
