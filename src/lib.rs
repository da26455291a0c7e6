pub mod clienv;
pub mod completions;
pub mod config;
pub mod daemon;
pub mod error;
pub mod http_server;
pub mod workloads;

pub use error::{DaemonError, Result};
