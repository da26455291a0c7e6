//! Workloads hosted by the `edged` binary.
//!
//! Protocol connectors, the equipment model, rule evaluation and the work
//! calendar plug in here as daemons; the heartbeat is the built-in one.

mod heartbeat;

pub use heartbeat::{heartbeat_daemon, Heartbeat, GET_HEARTBEAT, SET_REPORT_EVERY};

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::EdgedConfig;
use crate::daemon::{Daemon, WorkBarrier};

pub const ROOT_DAEMON: &str = "edge";

/// Build the default supervision tree: root `edge` with one heartbeat
/// daemon per configured worker name.
pub fn build_default_tree(config: &EdgedConfig, termination: Option<Arc<WorkBarrier>>) -> Result<Daemon> {
    let poll_timeout = config.poll_timeout();
    let policy = config.failure_policy();

    let mut builder = Daemon::builder(ROOT_DAEMON)
        .poll_timeout(poll_timeout)
        .failure_policy(policy);
    if let Some(barrier) = termination {
        builder = builder.termination_barrier(barrier);
    }
    let root = builder.build();

    for name in &config.heartbeat.workers {
        let (daemon, _) = heartbeat_daemon(name, poll_timeout, policy, config.heartbeat.report_every);
        root.add_daemon_child(daemon)?;
    }

    info!(
        root = ROOT_DAEMON,
        children = config.heartbeat.workers.len(),
        poll_timeout_ms = poll_timeout.as_millis() as u64,
        policy = %policy,
        "Supervision tree built"
    );
    Ok(root)
}
