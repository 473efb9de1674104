mod cli;

use clap::Parser;
use cli::Cli;
use ssh_session_manager::utils::logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        logger::init_with_level("debug");
    } else {
        logger::init();
    }

    tracing::debug!("SSH Session Manager - Starting...");
    cli::run(cli).await
}
