mod cli;
mod extract;
mod output;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let pretty = cli.pretty;

    match dispatch(cli.command, pretty).await {
        Ok(code) => code,
        Err(err) => {
            tracing::debug!(error = ?err, "Command failed");
            if output::print_json(&output::error_report(&err), pretty).is_err() {
                eprintln!("{err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Commands, pretty: bool) -> Result<ExitCode> {
    match command {
        Commands::Extract(args) => extract::run(args, pretty).await,
        Commands::Families => {
            output::print_json(&extract::families()?, pretty)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
