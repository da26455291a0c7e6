use thiserror::Error;

/// Errors raised by the supervision core.
///
/// Hook and handler failures carry the workload's own `anyhow::Error` so the
/// caller at the REST/CLI boundary sees the original cause chain.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("command '{command}' has no target state")]
    InvalidTargetState { command: String },

    #[error("daemon '{daemon}' is not running")]
    NotRunning { daemon: String },

    #[error("daemon '{daemon}' stopped before replying")]
    Disconnected { daemon: String },

    #[error("daemon '{daemon}' is in terminal state and cannot accept '{command}'")]
    Terminated { daemon: String, command: String },

    #[error("daemon '{daemon}' cannot accept commands from its own run loop or a descendant's")]
    Reentrant { daemon: String },

    #[error("adding '{child}' under '{parent}' would create a cycle")]
    CycleDetected { parent: String, child: String },

    #[error("daemon '{child}' already has a parent")]
    AlreadyParented { child: String },

    #[error("daemon '{parent}' already has a child named '{child}'")]
    DuplicateChild { parent: String, child: String },

    #[error("daemon '{daemon}' has already been started")]
    AlreadyStarted { daemon: String },

    #[error("{stage} hook failed for daemon '{daemon}': {source}")]
    Hook {
        daemon: String,
        stage: HookStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("handler for '{command}' failed on daemon '{daemon}': {source}")]
    Handler {
        daemon: String,
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("child '{child}' rejected '{command}': {source}")]
    Child {
        child: String,
        command: String,
        #[source]
        source: Box<DaemonError>,
    },

    #[error("failed to spawn run loop for '{daemon}': {source}")]
    Spawn {
        daemon: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),
}

/// Lifecycle hook a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Initialize,
    Cycle,
    Cleanup,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::Initialize => "initialize",
            HookStage::Cycle => "cycle",
            HookStage::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DaemonError {
    /// True when the target daemon's run loop is gone and will never reply.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::NotRunning { .. } | Self::Disconnected { .. } | Self::Terminated { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_errors_are_classified() {
        let gone = DaemonError::Disconnected {
            daemon: "edge".into(),
        };
        assert!(gone.is_unavailable());

        let handler = DaemonError::Handler {
            daemon: "edge".into(),
            command: "Run".into(),
            source: anyhow::anyhow!("boom"),
        };
        assert!(!handler.is_unavailable());
        assert!(handler.to_string().contains("boom"));
    }

    #[test]
    fn hook_error_names_stage() {
        let err = DaemonError::Hook {
            daemon: "sampler".into(),
            stage: HookStage::Cleanup,
            source: anyhow::anyhow!("socket closed"),
        };
        assert_eq!(
            err.to_string(),
            "cleanup hook failed for daemon 'sampler': socket closed"
        );
    }
}
