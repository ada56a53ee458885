// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent Manager & Receiver binary: serves the four agent ingestion routes
//! and runs the periodic stale-agent health sweep (spec §4.13).

use anyhow::{Context, Result};
use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServerStarter};
use tracing::info;

use keyspider_manager::config::ManagerConfig;
use keyspider_manager::context::ApiContext;
use keyspider_manager::{health, metrics, ReceiverImpl};

/// Default bind address for the HTTP server.
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8888";

/// Default maximum request body size (bytes). Agent event/key batches can
/// run large on a host with many users, so this is generous.
const DEFAULT_BODY_MAX_BYTES: usize = 32 * 1024 * 1024;

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_version();
                println!("Usage: {} [OPTIONS]", args[0]);
                println!();
                println!("Environment variables:");
                println!("  DATABASE_URL, API_URL          required");
                println!("  SSH_KEY_PATH, SSH_USERNAME");
                println!("  SSH_CONNECT_TIMEOUT, SSH_MAX_CONNECTIONS, SSH_PER_SERVER_LIMIT");
                println!("  AGENT_HEARTBEAT_STALENESS_SECS, AGENT_HEALTH_SWEEP_INTERVAL_SECS");
                println!("  BIND_ADDRESS                   default {DEFAULT_BIND_ADDRESS}");
                println!("  RUST_LOG                        default keyspider_manager=info,dropshot=info");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown option: {}", arg);
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "keyspider_manager=info,dropshot=info".to_string()),
        ))
        .init();

    print_version();

    let config = ManagerConfig::from_env().context("failed to load manager configuration")?;
    info!(database_url = %config.database_url_display(), "loaded configuration");

    metrics::register_metrics();

    let ctx = ApiContext::new(&config).await.context("failed to build API context")?;

    tokio::spawn(health::run_forever(
        ctx.store.clone(),
        config.heartbeat_staleness,
        config.health_sweep_interval,
    ));

    let api = keyspider_receiver_api::agent_receiver_api_mod::api_description::<ReceiverImpl>()
        .map_err(|e| anyhow::anyhow!("failed to build API description: {e}"))?;

    let bind_address = std::env::var("BIND_ADDRESS")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string())
        .parse()
        .context("invalid BIND_ADDRESS")?;

    let config_dropshot = ConfigDropshot {
        bind_address,
        default_request_body_max_bytes: DEFAULT_BODY_MAX_BYTES,
        default_handler_task_mode: dropshot::HandlerTaskMode::Detached,
        ..Default::default()
    };

    let config_logging = ConfigLogging::StderrTerminal {
        level: ConfigLoggingLevel::Info,
    };
    let log = config_logging
        .to_logger("keyspider-manager")
        .map_err(|e| anyhow::anyhow!("failed to create logger: {e}"))?;

    let server = HttpServerStarter::new(&config_dropshot, api, ctx, &log)
        .map_err(|e| anyhow::anyhow!("failed to create server: {e}"))?
        .start();

    info!("keyspider-manager running on http://{}", bind_address);

    server.await.map_err(|e| anyhow::anyhow!("server failed: {e}"))
}
