// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic sweep marking agents `inactive` once their heartbeat goes
//! stale (spec §4.13). Runs as a `tokio::spawn`ed task owned by `main`, the
//! same way the teacher's `main.rs` owns its config-watcher task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keyspider_core::persistence::PersistenceStore;
use tracing::{info, warn};

pub async fn run_forever(
    store: Arc<dyn PersistenceStore>,
    staleness: chrono::Duration,
    sweep_interval: Duration,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - staleness;
        match store.mark_stale_agents_inactive(cutoff).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "marked stale agents inactive"),
            Err(e) => warn!(error = %e, "agent health sweep failed"),
        }
    }
}
