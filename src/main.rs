//! Binary entry point: flags first, then logging, then the chosen lane.

use clap::Parser;
use saltmine::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    cli::init_tracing(&args.log_level);
    cli::run_with_cli(args).await
}
