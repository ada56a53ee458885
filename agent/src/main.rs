// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keyspider Agent binary: the on-host SSH access-graph collector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use keyspider_agent::client::ReceiverClient;
use keyspider_agent::config::AgentConfig;
use keyspider_agent::{loop_runner, metrics};

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
                println!(
                    "  CONFIG_PATH   path to the deploy-written config file (default {})",
                    keyspider_agent::config::DEFAULT_CONFIG_PATH
                );
                println!("  RUST_LOG      log filter (default keyspider_agent=info)");
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
            std::env::var("RUST_LOG").unwrap_or_else(|_| "keyspider_agent=info".to_string()),
        ))
        .init();

    print_version();
    metrics::register_metrics();

    // reqwest's rustls-tls backend needs a process-wide default crypto
    // provider installed before the first HTTPS request; ignore the error
    // if something else already installed one (e.g. in tests).
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AgentConfig::load(None).await.context("failed to load agent config")?;
    info!(server_id = %config.server_id, api_url = %config.api_url, "loaded agent config");

    let client = ReceiverClient::new(config.api_url.clone(), config.agent_token.clone())
        .context("failed to build HTTP client")?;

    let running = Arc::new(AtomicBool::new(true));
    install_signal_handlers(running.clone());

    loop_runner::run(config, client, running).await;

    Ok(())
}

/// SIGTERM/SIGINT flip `running` to `false`; the loop exits on its next
/// tick, matching §4.12's "the loop exits cleanly" shutdown contract.
fn install_signal_handlers(running: Arc<AtomicBool>) {
    let ctrl_c_flag = running.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_flag.store(false, Ordering::SeqCst);
        }
    });

    #[cfg(unix)]
    {
        let term_flag = running;
        tokio::spawn(async move {
            if let Ok(mut term) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                term.recv().await;
                term_flag.store(false, Ordering::SeqCst);
            }
        });
    }
}
