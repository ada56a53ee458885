// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Prometheus metrics for the Agent Manager & Receiver.

use prometheus::{Counter, Opts, Registry, TextEncoder};

#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref REGISTRY: Registry = Registry::new();

        pub static ref AGENT_EVENTS_INGESTED: Counter = Counter::with_opts(
            Opts::new(
                "keyspider_manager_agent_events_ingested_total",
                "Total SSH auth events ingested via the agent receiver"
            )
        ).expect("valid metric name");

        pub static ref AGENT_KEYS_INGESTED: Counter = Counter::with_opts(
            Opts::new(
                "keyspider_manager_agent_keys_ingested_total",
                "Total key records ingested via the agent receiver"
            )
        ).expect("valid metric name");

        pub static ref AGENT_DEPLOY_FAILURES: Counter = Counter::with_opts(
            Opts::new(
                "keyspider_manager_agent_deploy_failures_total",
                "Total failed agent deploy attempts"
            )
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{AGENT_DEPLOY_FAILURES, AGENT_EVENTS_INGESTED, AGENT_KEYS_INGESTED, REGISTRY};

#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(AGENT_EVENTS_INGESTED.clone()))
        .expect("failed to register AGENT_EVENTS_INGESTED");
    REGISTRY
        .register(Box::new(AGENT_KEYS_INGESTED.clone()))
        .expect("failed to register AGENT_KEYS_INGESTED");
    REGISTRY
        .register(Box::new(AGENT_DEPLOY_FAILURES.clone()))
        .expect("failed to register AGENT_DEPLOY_FAILURES");
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_events_counter_increments() {
        let before = AGENT_EVENTS_INGESTED.get();
        AGENT_EVENTS_INGESTED.inc();
        assert_eq!(AGENT_EVENTS_INGESTED.get() - before, 1.0);
    }
}
