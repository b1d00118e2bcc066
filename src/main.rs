mod audio;
mod cli;
mod engine;
mod metrics;
mod model;
mod orchestrator;
mod parser;
mod range;
mod speech;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli::run(args).await {
        Ok(()) => {
            // The stdin reader task may still be parked on a read.
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
