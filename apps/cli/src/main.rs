//! bookship CLI: build a documentation book and publish it on release.
//!
//! Evaluates the triggering event, provisions the toolchain, builds the
//! book with the configured generator and deploys it to static hosting.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
