//! DocHarvest CLI: crawl documentation into an embedded, searchable store.
//!
//! Runs crawl jobs with a live progress bar and inspects stored sources.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
