//! domharvest CLI: monthly gazette harvester.
//!
//! Discovers the municipal gazette PDFs of a month, downloads them, publishes
//! them to an anonymous file host and records the public links in a catalog.

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
