use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DaemonError;

/// What a daemon does when a command handler, a child or a cycle fails.
///
/// Initialization failures always end the run loop; cleanup failures are
/// recorded and the loop exits either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Terminate the run loop without cleanup. The failing submitter gets the
    /// error, later submitters get `Disconnected`.
    #[default]
    Crash,
    /// Return the error to the submitter and keep the daemon alive.
    Report,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Crash => "crash",
            FailurePolicy::Report => "report",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, FailurePolicy::Crash)
    }
}

impl FromStr for FailurePolicy {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crash" => Ok(FailurePolicy::Crash),
            "report" => Ok(FailurePolicy::Report),
            other => Err(DaemonError::Config(format!(
                "unknown failure policy '{}' (expected crash or report)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
