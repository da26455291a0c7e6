//! Command descriptors and the request/reply pair exchanged with a run loop.

use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use super::state::DaemonState;
use crate::error::{DaemonError, Result};

/// Parameters passed to hooks and command handlers.
pub type Params = HashMap<String, serde_json::Value>;

/// Values returned by a command handler.
pub type Results = HashMap<String, serde_json::Value>;

pub const RUN: &str = "Run";
pub const PAUSE: &str = "Pause";
pub const END: &str = "End";
pub const GET_STATE: &str = "GetState";

/// Result key the built-in `GetState` handler reports under.
pub const STATE_KEY: &str = "State";

/// Named administrative instruction.
///
/// Commands without a target state are queries and never move the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonCommand {
    name: String,
    target_state: Option<DaemonState>,
    input_param_names: Vec<String>,
}

impl DaemonCommand {
    /// Create a query command (no target state, no inputs).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_state: None,
            input_param_names: Vec::new(),
        }
    }

    /// Set the state applied once the command has been handled
    pub fn target(mut self, state: DaemonState) -> Self {
        self.target_state = Some(state);
        self
    }

    /// Declare the input parameter names the REST boundary turns into path segments
    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_param_names = names.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn run() -> Self {
        Self::new(RUN).target(DaemonState::RUNNING)
    }

    pub fn pause() -> Self {
        Self::new(PAUSE).target(DaemonState::PAUSED)
    }

    pub fn end() -> Self {
        Self::new(END).target(DaemonState::ENDED)
    }

    pub fn get_state() -> Self {
        Self::new(GET_STATE)
    }

    /// The four commands every daemon knows.
    pub fn standard() -> [DaemonCommand; 4] {
        [Self::run(), Self::pause(), Self::end(), Self::get_state()]
    }

    pub fn command_name(&self) -> &str {
        &self.name
    }

    pub fn has_target_state(&self) -> bool {
        self.target_state.is_some()
    }

    /// Target state of the command. Guard with [`has_target_state`](Self::has_target_state).
    pub fn target_state(&self) -> Result<DaemonState> {
        self.target_state
            .ok_or_else(|| DaemonError::InvalidTargetState {
                command: self.name.clone(),
            })
    }

    pub fn input_param_names(&self) -> &[String] {
        &self.input_param_names
    }
}

/// A command as seen by the daemon that executes it, populated in place.
#[derive(Debug)]
pub struct AdminCommand {
    pub command: DaemonCommand,
    pub params: Params,
    pub results: Results,
    pub err: Option<DaemonError>,
}

impl AdminCommand {
    pub fn new(command: DaemonCommand, params: Params) -> Self {
        Self {
            command,
            params,
            results: Results::new(),
            err: None,
        }
    }

    /// Split into the `(results, err)` pair a submitter sees.
    pub fn into_outcome(self) -> Result<Results> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }
}

/// Mailbox message: the command plus a one-shot slot for its reply.
pub(crate) struct AdminRequest {
    pub command: AdminCommand,
    pub reply: Sender<AdminCommand>,
}

impl AdminRequest {
    pub fn new(command: AdminCommand) -> (Self, Receiver<AdminCommand>) {
        let (reply, rx) = crossbeam_channel::bounded(1);
        (Self { command, reply }, rx)
    }
}
