// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Prometheus metrics for the on-host collector, following the same
//! lazy_static registry idiom as the manager's metrics module.

use prometheus::{Counter, Opts, Registry};

#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref REGISTRY: Registry = Registry::new();

        pub static ref HEARTBEATS_SENT: Counter = Counter::with_opts(
            Opts::new("keyspider_agent_heartbeats_sent_total", "Total heartbeats sent to the manager")
        ).expect("valid metric name");

        pub static ref EVENTS_POSTED: Counter = Counter::with_opts(
            Opts::new("keyspider_agent_events_posted_total", "Total SSH auth events posted to the manager")
        ).expect("valid metric name");

        pub static ref KEYS_POSTED: Counter = Counter::with_opts(
            Opts::new("keyspider_agent_keys_posted_total", "Total discovered keys posted to the manager")
        ).expect("valid metric name");

        pub static ref POST_FAILURES: Counter = Counter::with_opts(
            Opts::new("keyspider_agent_post_failures_total", "Total failed POSTs to the manager, by any route")
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{EVENTS_POSTED, HEARTBEATS_SENT, KEYS_POSTED, POST_FAILURES, REGISTRY};

#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY.register(Box::new(HEARTBEATS_SENT.clone())).expect("register heartbeats_sent");
    REGISTRY.register(Box::new(EVENTS_POSTED.clone())).expect("register events_posted");
    REGISTRY.register(Box::new(KEYS_POSTED.clone())).expect("register keys_posted");
    REGISTRY.register(Box::new(POST_FAILURES.clone())).expect("register post_failures");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeats_sent_counter_increments() {
        let before = HEARTBEATS_SENT.get();
        HEARTBEATS_SENT.inc();
        assert_eq!(HEARTBEATS_SENT.get() - before, 1.0);
    }
}
