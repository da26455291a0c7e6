//! Daemon supervision core
//!
//! Every long-running piece of the edge host (connector loops, equipment
//! service manager, calendar ticker, REST server) runs as a [`Daemon`]:
//! - one run-loop thread per daemon, advancing an explicit state machine
//! - administrative commands delivered through a rendezvous mailbox, each
//!   carrying its own one-shot reply slot
//! - commands forwarded synchronously to child daemons, in insertion order
//! - a counting barrier per daemon for outstanding child work, and a
//!   termination barrier plus OS signal handling at the root
//!
//! # Architecture
//!
//! ```text
//! submitter ──(AdminRequest + reply slot)──▶ mailbox ──▶ run loop
//!                                                       │
//!        ┌────────── accept_command ◀──── poll timeout ─┤
//!        │ handler → forward to children → wait barrier │
//!        │ → apply target state → reply                 │
//!        └──────────────────────────────▶ one cycle ────┘
//!
//!   INITIAL ──Run──▶ RUNNING ◀──Run── PAUSED
//!                      │  └───Pause───▶  │
//!                      └──────End──▶ ENDED ◀──End──┘
//! ```

pub mod barrier;
pub mod command;
pub mod core;
pub mod health;
pub mod policy;
mod signals;
pub mod state;
pub mod tree;

pub use self::core::{Daemon, DaemonBuilder, DaemonId, DEFAULT_POLL_TIMEOUT};
pub use barrier::{WorkBarrier, WorkGuard};
pub use command::{AdminCommand, DaemonCommand, Params, Results};
pub use health::HealthStatus;
pub use policy::FailurePolicy;
pub use state::DaemonState;
pub use tree::{TreeNode, TreeSnapshot};
