// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API context for the Agent Manager & Receiver.

use std::sync::Arc;

use anyhow::Result;
use keyspider_core::persistence::{PersistenceStore, PostgresStore};
use keyspider_core::spider::SpiderEngine;
use keyspider_core::ssh_pool::{PoolConfig, SshPool};

use crate::config::ManagerConfig;
use crate::deploy::AgentManager;

/// API context shared across all receiver request handlers, plus the
/// deploy-side `AgentManager` the CLI/operator surface (outside this
/// crate's scope) drives.
pub struct ApiContext {
    pub store: Arc<dyn PersistenceStore>,
    pub spider: SpiderEngine,
    pub agent_manager: AgentManager,
}

impl ApiContext {
    pub async fn new(config: &ManagerConfig) -> Result<Self> {
        let store: Arc<dyn PersistenceStore> = Arc::new(PostgresStore::new(&config.database_url).await?);

        let pool = Arc::new(SshPool::new(PoolConfig {
            max_total: config.ssh_max_connections,
            per_host: config.ssh_per_server_limit,
            connect_timeout: config.ssh_connect_timeout,
            username: config.ssh_username.clone(),
            key_path: config.ssh_key_path.clone(),
        }));

        let spider = SpiderEngine::new(pool.clone(), store.clone());
        let agent_manager = AgentManager::new(pool, store.clone(), config.api_url.clone());

        Ok(Self {
            store,
            spider,
            agent_manager,
        })
    }
}
