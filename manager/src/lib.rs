// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Agent Manager & Receiver service (spec §4.13).
//!
//! Deploys the on-host collector over the same SSH pool/SFTP reader the
//! Spider Engine uses, tracks its health, and ingests the four reports an
//! agent in the field POSTs back.
//!
//! # Modules
//!
//! - [`config`] - environment-loaded service configuration
//! - [`context`] - request-handler context: store, pool, spider, deployer
//! - [`deploy`] - token-bound agent deploy/uninstall
//! - [`receiver`] - `AgentReceiverApi` implementation
//! - [`health`] - periodic stale-agent sweep
//! - [`metrics`] - Prometheus counters

pub mod config;
pub mod context;
pub mod deploy;
pub mod health;
pub mod metrics;
pub mod receiver;

pub use receiver::ReceiverImpl;
