mod cli;

use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = cli::Cli::parse();
    tender_lifecycle::telemetry::init(cli.verbose);
    cli::app::execute(cli).await
}
