use std::path::PathBuf;

use clap::{Parser, Subcommand};
use edged::completions::CompletionShell;

#[derive(Parser)]
#[command(name = "edged")]
#[command(version)]
#[command(about = "Supervision host for edge middleware daemons", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start the daemon tree and serve the REST boundary until it ends
    Run {
        /// Port to listen on (overrides config and EDGED_HTTP_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to a config file (default: $EDGED_CONFIG_DIR/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the commands accepted by the default daemon tree
    Commands,

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        write: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}
