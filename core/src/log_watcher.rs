// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Long-lived tail of a single host's sshd log, parsed and fanned out to
//! registered consumers in real time.
//!
//! State machine: `starting` → `running` while the remote tail process is
//! alive and producing lines, `backoff` after an I/O failure or session
//! drop while reconnect is pending, `stopped` after an explicit `stop()`,
//! `error` if reconnection itself is abandoned. Every transition is
//! recorded on the session's `WatchSession` row by the caller; this module
//! only tracks the in-memory state and timing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::log_parser::{self, AuthEvent};
use crate::models::OsType;
use crate::ssh_pool::SshPool;

const INITIAL_DELAY: Duration = Duration::from_secs(5);
const MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    Connecting,
    Running,
    Backoff,
    Stopped,
}

/// A line event fanned out to every consumer. `Sentinel` is sent once per
/// consumer when `stop()` is called, so a consumer iterating a channel
/// receiver knows to terminate rather than hang forever.
#[derive(Debug, Clone)]
pub enum WatchMessage {
    Event(AuthEvent),
    Sentinel,
}

fn primary_log_path(os_type: OsType) -> &'static str {
    match os_type {
        OsType::Linux => "/var/log/auth.log",
        OsType::Aix => "/var/adm/sulog",
    }
}

pub struct LogWatcher {
    pub session_id: Uuid,
    host: String,
    port: u16,
    os_type: OsType,
    pool: Arc<SshPool>,
    running: Arc<AtomicBool>,
    consumers: Arc<tokio::sync::Mutex<Vec<mpsc::Sender<WatchMessage>>>>,
}

impl LogWatcher {
    pub fn new(host: String, port: u16, os_type: OsType, pool: Arc<SshPool>) -> Self {
        LogWatcher {
            session_id: Uuid::new_v4(),
            host,
            port,
            os_type,
            pool,
            running: Arc::new(AtomicBool::new(false)),
            consumers: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    pub async fn register(&self, sender: mpsc::Sender<WatchMessage>) {
        self.consumers.lock().await.push(sender);
    }

    /// Runs until `stop()` flips `running` to false. Intended to be spawned
    /// as its own task; reconnects with exponential backoff and resets the
    /// delay on the first successful line after a reconnect.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut delay = INITIAL_DELAY;

        while self.running.load(Ordering::SeqCst) {
            match self.tail_once().await {
                Ok(()) => {
                    delay = INITIAL_DELAY;
                }
                Err(e) => {
                    warn!(host = %self.host, port = self.port, error = %e, "log watcher connection dropped");
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                }
            }
        }

        self.broadcast_sentinel().await;
    }

    async fn tail_once(&self) -> Result<(), String> {
        let guard = self
            .pool
            .acquire(&self.host, self.port)
            .await
            .map_err(|e| e.to_string())?;

        let path = primary_log_path(self.os_type);
        let command = format!("tail -n0 -F {}", path);

        let result = {
            let mut session = guard.session.lock().await;
            let mut channel = session
                .exec_streaming(&command)
                .await
                .ok_or_else(|| "failed to start tail".to_string())?;

            let mut first_line_seen = false;
            let mut last_timestamp = None;
            loop {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                let Some(line) = channel.next_line().await else {
                    break;
                };
                first_line_seen = true;
                if let Some(event) =
                    log_parser::parse_line(&line, self.os_type, chrono::Utc::now(), last_timestamp)
                {
                    last_timestamp = Some(event.timestamp);
                    self.dispatch(event).await;
                } else {
                    debug!(line = %line, "log watcher: unparsed line");
                }
            }

            if first_line_seen {
                Ok(())
            } else {
                Err("session ended before any line was read".to_string())
            }
        };

        self.pool.release(guard).await;
        result
    }

    async fn dispatch(&self, event: AuthEvent) {
        let consumers = self.consumers.lock().await;
        for sender in consumers.iter() {
            if sender.send(WatchMessage::Event(event.clone())).await.is_err() {
                debug!("log watcher consumer channel closed");
            }
        }
    }

    async fn broadcast_sentinel(&self) {
        let consumers = self.consumers.lock().await;
        for sender in consumers.iter() {
            let _ = sender.send(WatchMessage::Sentinel).await;
        }
    }

    /// Flip `running` to false. The in-flight `run()` loop notices on its
    /// next check and sends the sentinel to every consumer before
    /// returning.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let mut delay = INITIAL_DELAY;
        for _ in 0..10 {
            delay = (delay * 2).min(MAX_DELAY);
        }
        assert_eq!(delay, MAX_DELAY);
    }

    #[test]
    fn primary_log_path_differs_by_os() {
        assert_eq!(primary_log_path(OsType::Linux), "/var/log/auth.log");
        assert_eq!(primary_log_path(OsType::Aix), "/var/adm/sulog");
    }

    #[tokio::test]
    async fn stop_flips_running_flag() {
        let pool = Arc::new(SshPool::new(crate::ssh_pool::PoolConfig {
            max_total: 1,
            per_host: 1,
            connect_timeout: Duration::from_millis(10),
            username: "root".to_string(),
            key_path: "/nonexistent".to_string(),
        }));
        let watcher = LogWatcher::new("198.51.100.5".to_string(), 22, OsType::Linux, pool);
        watcher.running.store(true, Ordering::SeqCst);
        assert!(watcher.is_running());
        watcher.stop();
        assert!(!watcher.is_running());
    }
}
