use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::daemon::{Daemon, DaemonCommand, FailurePolicy, Params, Results};

pub const GET_HEARTBEAT: &str = "GetHeartbeat";
pub const SET_REPORT_EVERY: &str = "SetReportEvery";

/// Liveness workload: counts cycles and logs a heartbeat every N of them.
#[derive(Debug)]
pub struct Heartbeat {
    beats: AtomicU64,
    report_every: AtomicU64,
}

impl Heartbeat {
    pub fn new(report_every: u64) -> Self {
        Self {
            beats: AtomicU64::new(0),
            report_every: AtomicU64::new(report_every.max(1)),
        }
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    pub fn report_every(&self) -> u64 {
        self.report_every.load(Ordering::Relaxed)
    }

    fn beat(&self, daemon: &Daemon) -> usize {
        let beats = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        if beats % self.report_every() == 0 {
            info!(daemon = %daemon.name(), beats, "heartbeat");
        }
        1
    }

    fn snapshot(&self) -> Results {
        let mut results = Results::new();
        results.insert("beats".into(), self.beats().into());
        results.insert("report_every".into(), self.report_every().into());
        results
    }

    fn set_report_every(&self, params: &Params) -> anyhow::Result<Results> {
        let every = params
            .get("every")
            .context("missing parameter 'every'")?;
        let every = match every {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .filter(|n| *n > 0)
        .with_context(|| format!("'every' must be a positive integer, got {}", every))?;

        self.report_every.store(every, Ordering::Relaxed);
        Ok(self.snapshot())
    }
}

/// Build a daemon hosting a [`Heartbeat`]; the shared state is returned for inspection.
pub fn heartbeat_daemon(
    name: &str,
    poll_timeout: Duration,
    policy: FailurePolicy,
    report_every: u64,
) -> (Daemon, Arc<Heartbeat>) {
    let heartbeat = Arc::new(Heartbeat::new(report_every));

    let cycle_state = Arc::clone(&heartbeat);
    let cleanup_state = Arc::clone(&heartbeat);
    let daemon = Daemon::builder(name)
        .poll_timeout(poll_timeout)
        .failure_policy(policy)
        .initialize(|daemon, _| {
            info!(daemon = %daemon.name(), "heartbeat ready");
            Ok(())
        })
        .one_cycle(move |daemon| Ok(cycle_state.beat(daemon)))
        .cleanup(move |daemon, _| {
            info!(daemon = %daemon.name(), beats = cleanup_state.beats(), "heartbeat stopped");
            Ok(())
        })
        .build();

    let query_state = Arc::clone(&heartbeat);
    daemon.add_command_fxn(DaemonCommand::new(GET_HEARTBEAT), move |_, _| {
        Ok(query_state.snapshot())
    });

    let update_state = Arc::clone(&heartbeat);
    daemon.add_command_fxn(
        DaemonCommand::new(SET_REPORT_EVERY).inputs(["every"]),
        move |_, params| update_state.set_report_every(params),
    );

    (daemon, heartbeat)
}
