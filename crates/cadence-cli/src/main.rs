mod bootstrap;
mod cli_args;
mod commands;

use std::process::ExitCode;

use clap::Parser;

use crate::bootstrap::init_tracing;
use crate::cli_args::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match commands::run_cli(cli).await {
        Ok(code) => code,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "cadence failed");
            eprintln!("cadence: {error:#}");
            ExitCode::FAILURE
        }
    }
}
