mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { port, config } => commands::run::cmd_run(port, config).await?,
        Commands::Commands => commands::list::cmd_commands()?,
        Commands::Config { write } => commands::config::cmd_config(write)?,
        Commands::Completions { shell } => commands::completions::cmd_completions(shell),
    }

    Ok(())
}
