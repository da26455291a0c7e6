use serde::Serialize;

use super::core::Daemon;
use super::state::DaemonState;
use super::tree::TreeSnapshot;

/// Health summary of a supervision tree, backing the readiness endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthStatus {
    /// Total number of daemons
    pub total: usize,
    /// Daemons that have not been started or have not received Run yet
    pub initial: usize,
    pub running: usize,
    pub paused: usize,
    /// Daemons that reached a terminal state and exited cleanly
    pub ended: usize,
    /// Daemons whose run loop is gone without a clean terminal exit
    pub dead: usize,
    /// Names of daemons that need attention
    pub unhealthy: Vec<String>,
}

impl HealthStatus {
    pub fn from_snapshot(snapshot: &TreeSnapshot) -> Self {
        let mut status = HealthStatus {
            total: snapshot.len(),
            ..HealthStatus::default()
        };

        for node in &snapshot.nodes {
            let crashed = node.last_error.is_some()
                || (!node.alive && node.state != DaemonState::INITIAL && !node.state.is_terminal_state());

            if crashed {
                status.dead += 1;
                status.unhealthy.push(node.name.clone());
                continue;
            }

            if node.state.is_terminal_state() {
                status.ended += 1;
            } else if node.state == DaemonState::RUNNING {
                status.running += 1;
            } else if node.state == DaemonState::PAUSED {
                status.paused += 1;
            } else if node.state == DaemonState::INITIAL {
                status.initial += 1;
            }
        }

        status
    }

    pub fn of(root: &Daemon) -> Self {
        Self::from_snapshot(&TreeSnapshot::capture(root))
    }

    /// Ready once every daemon has been started and told to run (or pause),
    /// and none has ended or died.
    pub fn is_ready(&self) -> bool {
        self.total > 0
            && self.initial == 0
            && self.dead == 0
            && self.ended == 0
            && self.unhealthy.is_empty()
    }
}
