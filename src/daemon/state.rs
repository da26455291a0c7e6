use serde::Serialize;

/// Named lifecycle state of a daemon.
///
/// A state only carries two facts the run loop cares about: whether the
/// one-cycle hook may run while in it, and whether reaching it ends the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DaemonState {
    name: &'static str,
    can_execute_cycles: bool,
    is_terminal: bool,
}

impl DaemonState {
    pub const INITIAL: DaemonState = DaemonState::new("INITIAL", false, false);
    pub const RUNNING: DaemonState = DaemonState::new("RUNNING", true, false);
    pub const PAUSED: DaemonState = DaemonState::new("PAUSED", false, false);
    pub const ENDED: DaemonState = DaemonState::new("ENDED", true, true);

    /// Define a workload-specific state.
    pub const fn new(name: &'static str, can_execute_cycles: bool, is_terminal: bool) -> Self {
        Self {
            name,
            can_execute_cycles,
            is_terminal,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.name
    }

    pub fn can_execute_cycles(&self) -> bool {
        self.can_execute_cycles
    }

    pub fn is_terminal_state(&self) -> bool {
        self.is_terminal
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_flags() {
        assert!(!DaemonState::INITIAL.can_execute_cycles());
        assert!(!DaemonState::INITIAL.is_terminal_state());
        assert!(DaemonState::RUNNING.can_execute_cycles());
        assert!(!DaemonState::PAUSED.can_execute_cycles());
        assert!(DaemonState::ENDED.is_terminal_state());
        assert!(DaemonState::ENDED.can_execute_cycles());
    }

    #[test]
    fn default_is_initial() {
        assert_eq!(DaemonState::default(), DaemonState::INITIAL);
        assert_eq!(DaemonState::default().to_string(), "INITIAL");
    }

    #[test]
    fn serializes_flags() {
        let json = serde_json::to_value(DaemonState::PAUSED).unwrap();
        assert_eq!(json["name"], "PAUSED");
        assert_eq!(json["can_execute_cycles"], false);
        assert_eq!(json["is_terminal"], false);
    }
}
