// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The agent's cooperative main loop (spec §4.12): a single task, no
//! threads, one `tokio::time::interval` tick per second. Each tick checks
//! whether the heartbeat and collect cadences have elapsed and fires the
//! corresponding action. `running` is flipped to `false` by the signal
//! handler installed in `main`; the loop exits cleanly on the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::client::ReceiverClient;
use crate::collector::LogCollector;
use crate::config::AgentConfig;
use crate::inventory;
use crate::metrics;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(config: AgentConfig, client: ReceiverClient, running: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    let mut collector = LogCollector::new();

    let mut last_heartbeat = Instant::now() - config.heartbeat_interval();
    let mut last_collect = Instant::now() - config.collect_interval();

    while running.load(Ordering::SeqCst) {
        ticker.tick().await;

        if last_heartbeat.elapsed() >= config.heartbeat_interval() {
            last_heartbeat = Instant::now();
            if let Err(e) = client.heartbeat(config.server_id, &config.agent_version).await {
                error!(error = %e, "heartbeat failed");
                metrics::POST_FAILURES.inc();
            } else {
                metrics::HEARTBEATS_SENT.inc();
            }
        }

        if last_collect.elapsed() >= config.collect_interval() {
            last_collect = Instant::now();
            run_collect_cycle(&config, &client, &mut collector).await;
        }
    }

    info!("agent loop exiting cleanly");
}

async fn run_collect_cycle(config: &AgentConfig, client: &ReceiverClient, collector: &mut LogCollector) {
    let (auth_events, sudo_events) = collector.collect(&config.log_paths).await;

    if !auth_events.is_empty() {
        match client.post_events(config.server_id, &auth_events).await {
            Ok(()) => metrics::EVENTS_POSTED.inc_by(auth_events.len() as f64),
            Err(e) => {
                error!(error = %e, count = auth_events.len(), "failed to post auth events");
                metrics::POST_FAILURES.inc();
            }
        }
    }

    if !sudo_events.is_empty() {
        if let Err(e) = client.post_sudo_events(config.server_id, &sudo_events).await {
            error!(error = %e, count = sudo_events.len(), "failed to post sudo events");
            metrics::POST_FAILURES.inc();
        }
    }

    let keys = inventory::scan_local_host().await;
    if !keys.is_empty() {
        match client.post_keys(config.server_id, &keys).await {
            Ok(()) => metrics::KEYS_POSTED.inc_by(keys.len() as f64),
            Err(e) => {
                error!(error = %e, count = keys.len(), "failed to post key inventory");
                metrics::POST_FAILURES.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> AgentConfig {
        serde_json::from_value(serde_json::json!({
            "api_url": server.uri(),
            "server_id": Uuid::new_v4(),
            "agent_token": "sekrit",
            "heartbeat_interval": 1,
            "collect_interval": 1,
            "log_paths": [],
            "agent_version": "1.0.0",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn run_exits_promptly_when_running_flips_false_before_first_tick() {
        let server = MockServer::start().await;
        let config = test_config(&server);
        let client = ReceiverClient::new(config.api_url.clone(), config.agent_token.clone()).unwrap();
        let running = Arc::new(AtomicBool::new(false));

        // `running` is already false, so the loop must exit without ever
        // ticking or posting anything (no mocks are mounted, so a stray
        // request would fail the test via an unmatched-request panic).
        run(config, client, running).await;
    }

    #[tokio::test]
    async fn collect_cycle_posts_nothing_when_no_log_paths_configured() {
        let server = MockServer::start().await;
        let config = test_config(&server);
        let client = ReceiverClient::new(config.api_url.clone(), config.agent_token.clone()).unwrap();
        let mut collector = LogCollector::new();
        run_collect_cycle(&config, &client, &mut collector).await;
    }
}
