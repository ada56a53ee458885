// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SSH access-graph acquisition and correlation engine.
//!
//! This crate is the data-acquisition and correlation plane described for
//! the fleet-wide SSH access graph: it crawls hosts over SSH, discovers
//! authorized and identity keys, parses authentication logs, tracks
//! real-time log tails, classifies sources it cannot reach, reconciles
//! authorization against observed usage, and serves graph views over the
//! result. The REST/WebSocket API surface, the CLI, and user
//! authentication are external collaborators; this crate meets them only
//! at the [`persistence`] trait and the agent wire shapes its sibling
//! crates (`keyspider-agent`, `keyspider-manager`) define.
//!
//! # Modules
//!
//! - [`models`] — the access-graph data model
//! - [`error`] — the shared error type
//! - [`fingerprint`] — public-key parsing and fingerprinting
//! - [`log_parser`] — sshd/sudo/journald line parsing
//! - [`sftp`] — remote file I/O over the SFTP subsystem
//! - [`ssh_pool`] — the bounded, health-checked SSH connection pool
//! - [`key_scanner`] — per-host authorized/identity/host key discovery
//! - [`log_watcher`] — long-lived tail-follow of a host's sshd log
//! - [`unreachable`] — classification of sources observed but not reachable
//! - [`persistence`] — the storage contract and its two implementations
//! - [`spider`] — the BFS crawl engine
//! - [`graph`] — graph views over the persisted model

pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod key_scanner;
pub mod log_parser;
pub mod log_watcher;
pub mod models;
pub mod persistence;
pub mod sftp;
pub mod spider;
pub mod ssh_pool;
pub mod unreachable;

pub use error::{KeyspiderError, Result};
